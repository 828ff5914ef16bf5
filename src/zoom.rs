//! Direct-forward path for the zoom camera.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{Receiver, SyncSender};
use std::thread::JoinHandle;

use crate::frame::Frame;

/// Largest zoom id before the sequence wraps back to 1.
pub const ZOOM_ID_MAX: u32 = 9999;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoomFrame {
    pub zoom_id: u32,
    pub frame: Frame,
}

/// Sequence `1, 2, ..., ZOOM_ID_MAX, 1, ...`.
#[derive(Clone, Debug, Default)]
pub struct ZoomIdSequence {
    last: u32,
}

impl ZoomIdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        self.last = if self.last >= ZOOM_ID_MAX {
            1
        } else {
            self.last + 1
        };
        self.last
    }
}

pub struct ZoomForwarder {
    ids: ZoomIdSequence,
}

impl ZoomForwarder {
    pub fn new() -> Self {
        Self {
            ids: ZoomIdSequence::new(),
        }
    }

    pub fn forward(&mut self, frame: Frame) -> ZoomFrame {
        ZoomFrame {
            zoom_id: self.ids.next_id(),
            frame,
        }
    }

    /// Forwards every zoom frame until either side of the pipe closes.
    pub fn spawn(
        mut self,
        frames: Receiver<Frame>,
        out: SyncSender<ZoomFrame>,
    ) -> ZoomForwarderHandle {
        let join = std::thread::spawn(move || {
            for frame in frames {
                let zoom = self.forward(frame);
                log::debug!("zoom {}: frame at {}", zoom.zoom_id, zoom.frame.captured_at());
                if out.send(zoom).is_err() {
                    log::info!("zoom forwarder: receiver dropped");
                    return;
                }
            }
            log::info!("zoom forwarder: frame channel closed");
        });
        ZoomForwarderHandle { join }
    }
}

impl Default for ZoomForwarder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ZoomForwarderHandle {
    join: JoinHandle<()>,
}

impl ZoomForwarderHandle {
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| anyhow!("zoom forwarder thread panicked"))
    }
}
