//! Cross-camera correlation.
//!
//! Panoramic frames are buffered in a `FrameRing`; each zoom-side request is
//! answered with the nearest panoramic frame, provided it lies inside the
//! configured window around the zoom frame time.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::CorrelationError;
use crate::frame::{Frame, FrameRing};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelationRequest {
    pub request_id: u32,
    pub zoom_frame_time: DateTime<Utc>,
}

/// Exactly one answer per request.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationResult {
    pub request_id: u32,
    pub outcome: Result<Arc<Frame>, CorrelationError>,
}

impl CorrelationResult {
    pub fn frame(&self) -> Option<&Arc<Frame>> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<CorrelationError> {
        self.outcome.as_ref().err().copied()
    }
}

/// Accepted range for `panoramic.captured_at - zoom_frame_time`.
///
/// A frame further ahead than `max` is `TooEarly`; one further behind than
/// `min` is `TooLate`. Both bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelationWindow {
    min: TimeDelta,
    max: TimeDelta,
}

impl CorrelationWindow {
    pub fn new(min: TimeDelta, max: TimeDelta) -> Self {
        Self { min, max }
    }

    pub fn min(&self) -> TimeDelta {
        self.min
    }

    pub fn max(&self) -> TimeDelta {
        self.max
    }

    pub fn validate(
        &self,
        frame_time: DateTime<Utc>,
        zoom_frame_time: DateTime<Utc>,
    ) -> Result<(), CorrelationError> {
        let delta = frame_time - zoom_frame_time;
        if delta > self.max {
            Err(CorrelationError::TooEarly)
        } else if delta < self.min {
            Err(CorrelationError::TooLate)
        } else {
            Ok(())
        }
    }
}

pub struct CorrelationService {
    ring: Arc<FrameRing>,
    window: CorrelationWindow,
}

impl CorrelationService {
    pub fn new(ring: Arc<FrameRing>, window: CorrelationWindow) -> Self {
        Self { ring, window }
    }

    pub fn ring(&self) -> &Arc<FrameRing> {
        &self.ring
    }

    pub fn window(&self) -> CorrelationWindow {
        self.window
    }

    /// Answers one request against the current ring contents.
    pub fn correlate(&self, request: CorrelationRequest) -> CorrelationResult {
        let outcome = self
            .ring
            .frame(request.zoom_frame_time)
            .map_err(CorrelationError::from)
            .and_then(|frame| {
                self.window
                    .validate(frame.captured_at(), request.zoom_frame_time)
                    .map(|()| frame)
            });

        match &outcome {
            Ok(frame) => log::info!(
                "request {}: zoom {} matched panoramic {} ({} ms)",
                request.request_id,
                request.zoom_frame_time,
                frame.captured_at(),
                (frame.captured_at() - request.zoom_frame_time).num_milliseconds()
            ),
            Err(err) => log::warn!(
                "request {}: zoom {}: {}",
                request.request_id,
                request.zoom_frame_time,
                err
            ),
        }

        CorrelationResult {
            request_id: request.request_id,
            outcome,
        }
    }

    /// Runs the service on two threads: one feeds `frames` into the ring, the
    /// other answers `requests` on `results`. Each thread exits when its input
    /// channel disconnects; the request side also exits if `results` is dropped.
    pub fn spawn(
        self,
        frames: Receiver<Frame>,
        requests: Receiver<CorrelationRequest>,
        results: SyncSender<CorrelationResult>,
    ) -> CorrelationHandle {
        let ring = self.ring.clone();
        let ingest = std::thread::spawn(move || {
            for frame in frames {
                ring.add(frame);
            }
            log::info!("correlation: panoramic frame channel closed");
        });
        let answer = std::thread::spawn(move || {
            for request in requests {
                if results.send(self.correlate(request)).is_err() {
                    log::info!("correlation: result receiver dropped");
                    return;
                }
            }
            log::info!("correlation: request channel closed");
        });
        CorrelationHandle {
            threads: vec![ingest, answer],
        }
    }
}

pub struct CorrelationHandle {
    threads: Vec<JoinHandle<()>>,
}

impl CorrelationHandle {
    /// Waits for both service threads; they stop once their inputs close.
    pub fn join(self) -> Result<()> {
        for thread in self.threads {
            thread
                .join()
                .map_err(|_| anyhow!("correlation thread panicked"))?;
        }
        Ok(())
    }
}
