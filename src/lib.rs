//! Gate Sync
//!
//! Frame synchronization core for a two-camera vehicle access point: a wide
//! "panoramic" camera and a narrow "zoom" camera watching the same gate.
//!
//! # Architecture
//!
//! ```text
//! CameraSession (panoramic) --frames--> CorrelationService --results--> consumer
//!                                              ^
//! CameraSession (zoom) --frames--> ZoomForwarder --zoom frames--> consumer --requests--+
//! ```
//!
//! 1. **Ingestion**: each camera session syncs the camera clock, decodes the
//!    multipart stream and stamps frames with drift-checked capture times.
//! 2. **Buffering**: panoramic frames live in a fixed-capacity `FrameRing`.
//! 3. **Correlation**: a zoom-side request is answered with the nearest
//!    panoramic frame, or a typed error if it falls outside the window.
//! 4. **Keyed stores**: `PlateGate` and `GpsLookup` are short-lived buffers
//!    with a periodic 60-minute sweep, fed by the downstream stage.
//!
//! All channels are bounded `std::sync::mpsc` channels created by the caller.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and `FrameRing`
//! - `ingest`: camera sessions (clock, multipart, metadata, HTTP link)
//! - `correlate`: `CorrelationService` and its request/result types
//! - `zoom`: zoom frame forwarding with wrapping ids
//! - `store`: `TimeKeyedStore`, `PlateGate`, `GpsLookup`
//! - `task`: shutdown flag and periodic background tasks
//! - `config`: daemon configuration

pub mod config;
pub mod correlate;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod store;
pub mod task;
pub mod zoom;

pub use config::{CameraSettings, GateSyncConfig, WindowSettings};
pub use correlate::{
    CorrelationHandle, CorrelationRequest, CorrelationResult, CorrelationService,
    CorrelationWindow,
};
pub use error::{CameraError, CorrelationError, FrameNotFound, GpsNotFound};
pub use frame::{Frame, FrameRing};
pub use ingest::{CameraLink, CameraSession, HttpCameraLink, SessionHandle, SessionState};
pub use store::{GpsFix, GpsLookup, GpsReply, PlateGate, PlateRecord, TimeKeyedStore};
pub use task::{PeriodicTask, Shutdown};
pub use zoom::{ZoomForwarder, ZoomFrame, ZOOM_ID_MAX};
