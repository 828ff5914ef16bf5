//! Error taxonomy for the synchronization core.
//!
//! Camera failures are recovered inside the session's retry loops. Lookup and
//! window failures are handed to callers as data.

use std::time::Duration;
use thiserror::Error;

/// Connection-level failures of a camera session. None of these are fatal.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("clock sync unavailable for camera {address} after {attempts} attempts")]
    SyncUnavailable { address: String, attempts: usize },

    #[error("malformed multipart header: {0}")]
    MalformedHeader(String),

    #[error("stream ended after {received} of {expected} body bytes")]
    TruncatedBody { expected: usize, received: usize },

    #[error("no frame decoded within {0:?}; connection closed by watchdog")]
    StaleStream(Duration),

    #[error("camera stream closed")]
    StreamClosed,

    #[error("camera connection failed: {0}")]
    Connect(String),

    #[error("invalid uptime response: {0:?}")]
    UptimeResponse(String),

    #[error("camera i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a correlation request produced no panoramic frame.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("no panoramic frame buffered")]
    NotFound,

    #[error("panoramic frame is ahead of the zoom trigger beyond the window")]
    TooEarly,

    #[error("panoramic frame is behind the zoom trigger beyond the window")]
    TooLate,
}

/// Lookup on an empty frame ring.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("frame ring is empty")]
pub struct FrameNotFound;

impl From<FrameNotFound> for CorrelationError {
    fn from(_: FrameNotFound) -> Self {
        CorrelationError::NotFound
    }
}

/// No GPS fix stored for the requested time of day.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("no gps fix recorded for the requested time of day")]
pub struct GpsNotFound;
