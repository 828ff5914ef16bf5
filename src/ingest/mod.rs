//! Camera ingestion.
//!
//! A camera session turns a network camera into a channel of timestamped
//! frames:
//! - `link`: HTTP access to the camera (uptime probe, multipart stream)
//! - `clock`: baseline estimation and drift-checked frame timestamps
//! - `mjpeg`: multipart part decoding
//! - `metadata`: capture offset and day/night state from the JPEG comment
//! - `session`: the reconnecting session loop and its stall watchdog
//!
//! The ingestion layer never logs frame payloads.

pub mod clock;
pub mod link;
pub mod metadata;
pub mod mjpeg;
pub mod session;

pub use clock::{FrameClock, UptimeProbe};
pub use link::HttpCameraLink;
pub use metadata::FrameMetadata;
pub use mjpeg::{MultipartDecoder, PartHeader};
pub use session::{
    CameraLink, CameraSession, ConnectionCloser, SessionHandle, SessionState, SessionTiming,
};
