//! Camera session: sync, stream, timestamp, reconnect.
//!
//! ```text
//! DISCONNECTED -> SYNCING -> STREAMING -> (DRIFT_DETECTED -> SYNCING) -> STREAMING
//! ```
//!
//! Every connection failure (connect, decode, watchdog close) goes back to
//! DISCONNECTED and retries after a fixed delay, forever. A session ends only
//! on shutdown or when nobody is receiving its frames.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::io::BufRead;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::clock::FrameClock;
use super::metadata;
use super::mjpeg::MultipartDecoder;
use crate::error::CameraError;
use crate::frame::Frame;
use crate::task::{PeriodicTask, Shutdown};

/// Liveness window of the stall watchdog.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(2);
/// Delay between reconnect and resync attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Extra pause after the camera closed the stream cleanly.
pub const STREAM_CLOSED_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Syncing,
    Streaming,
    DriftDetected,
}

/// The network side of a camera.
pub trait CameraLink: Send {
    fn address(&self) -> &str;

    /// Estimates the camera's clock baseline.
    fn sync_clock(&self) -> Result<DateTime<Utc>, CameraError>;

    /// Opens the multipart image stream.
    ///
    /// `register` must be called with the connection's closer as soon as the
    /// connection exists, before any blocking read, so a stalled handshake can
    /// be torn down like a stalled stream.
    fn open_stream(
        &self,
        register: &dyn Fn(ConnectionCloser),
    ) -> Result<Box<dyn BufRead + Send>, CameraError>;
}

/// Handle that can tear down a connection from another thread, unblocking a
/// reader stuck in `read`.
#[derive(Clone, Debug, Default)]
pub struct ConnectionCloser {
    socket: Option<Arc<TcpStream>>,
}

impl ConnectionCloser {
    pub fn tcp(socket: TcpStream) -> Self {
        Self {
            socket: Some(Arc::new(socket)),
        }
    }

    /// A closer for connections that cannot be interrupted.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionTiming {
    pub reconnect_delay: Duration,
    pub sync_backoff: Duration,
    pub watchdog_period: Duration,
    pub stream_closed_pause: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            sync_backoff: RECONNECT_DELAY,
            watchdog_period: WATCHDOG_PERIOD,
            stream_closed_pause: STREAM_CLOSED_PAUSE,
        }
    }
}

pub struct CameraSession<L> {
    name: String,
    link: L,
    timing: SessionTiming,
    clock: FrameClock,
    state: Arc<Mutex<SessionState>>,
    watchdog: Arc<StallWatchdog>,
    shutdown: Shutdown,
}

enum PumpExit {
    Failed(CameraError),
    ReceiverGone,
    Stopped,
}

impl<L: CameraLink + 'static> CameraSession<L> {
    pub fn new(name: impl Into<String>, link: L) -> Self {
        Self {
            name: name.into(),
            link,
            timing: SessionTiming::default(),
            clock: FrameClock::new(),
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            watchdog: Arc::new(StallWatchdog::default()),
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the session on its own thread, sending frames to `frames`.
    pub fn spawn(self, frames: SyncSender<Frame>) -> SessionHandle {
        let name = self.name.clone();
        let state = self.state.clone();
        let watchdog = self.watchdog.clone();
        let shutdown = self.shutdown.clone();
        let join = std::thread::spawn(move || self.run(frames));
        SessionHandle {
            name,
            state,
            watchdog,
            shutdown,
            join: Some(join),
        }
    }

    /// Blocking session loop.
    pub fn run(mut self, frames: SyncSender<Frame>) {
        log::info!("camera {}: session started ({})", self.name, self.link.address());
        let _watchdog_task = self.watchdog.spawn_checker(&self.name, self.timing.watchdog_period);

        while !self.shutdown.is_requested() {
            self.set_state(SessionState::Syncing);
            let Some(baseline) = self.sync_until_ready() else {
                break;
            };
            self.clock.set_baseline(baseline);

            let opened = {
                let watchdog = &self.watchdog;
                let shutdown = &self.shutdown;
                self.link.open_stream(&|closer| {
                    watchdog.arm(closer);
                    if shutdown.is_requested() {
                        watchdog.disarm();
                    }
                })
            };
            let reader = match opened {
                Ok(reader) => reader,
                Err(err) => {
                    let err = self.classify(err);
                    self.watchdog.disarm();
                    log::warn!("camera {}: video connection failed: {}", self.name, err);
                    self.set_state(SessionState::Disconnected);
                    self.shutdown.sleep(self.timing.reconnect_delay);
                    continue;
                }
            };
            log::info!("camera {}: connected to {}", self.name, self.link.address());
            if self.shutdown.is_requested() {
                self.watchdog.disarm();
                break;
            }
            self.set_state(SessionState::Streaming);

            let exit = self.pump(reader, &frames);
            self.watchdog.disarm();
            self.set_state(SessionState::Disconnected);

            match exit {
                PumpExit::Stopped => break,
                PumpExit::ReceiverGone => {
                    log::info!("camera {}: frame receiver dropped, stopping", self.name);
                    break;
                }
                PumpExit::Failed(err) => {
                    log::warn!("camera {}: stream failed: {}; reconnecting", self.name, err);
                    if matches!(err, CameraError::StreamClosed) {
                        self.shutdown.sleep(self.timing.stream_closed_pause);
                    }
                    self.shutdown.sleep(self.timing.reconnect_delay);
                }
            }
        }

        self.set_state(SessionState::Disconnected);
        log::info!("camera {}: session stopped", self.name);
    }

    fn pump(&mut self, reader: Box<dyn BufRead + Send>, frames: &SyncSender<Frame>) -> PumpExit {
        let mut decoder = MultipartDecoder::new(reader);
        loop {
            let payload = match decoder.next_image() {
                Ok((_, payload)) => payload,
                Err(_) if self.shutdown.is_requested() => return PumpExit::Stopped,
                Err(err) => return PumpExit::Failed(self.classify(err)),
            };
            self.watchdog.feed();

            let Some(frame) = self.timestamp(payload) else {
                return PumpExit::Stopped;
            };
            if frames.send(frame).is_err() {
                return PumpExit::ReceiverGone;
            }
        }
    }

    /// A read failure caused by the watchdog closing the socket is a stall.
    fn classify(&self, err: CameraError) -> CameraError {
        if self.watchdog.tripped() {
            CameraError::StaleStream(self.timing.watchdog_period)
        } else {
            err
        }
    }

    /// Builds a frame from a decoded image, resyncing on drift.
    fn timestamp(&mut self, payload: Vec<u8>) -> Option<Frame> {
        let meta = metadata::extract(&payload);
        let name = &self.name;
        let link = &self.link;
        let state = &self.state;
        let shutdown = &self.shutdown;
        let backoff = self.timing.sync_backoff;
        let last = self.clock.last_frame_time();

        let captured_at = self.clock.stamp(meta.capture_offset_ms, || {
            log::warn!(
                "camera {}: drift detected at offset {} ms (last frame {:?}); resyncing",
                name,
                meta.capture_offset_ms,
                last
            );
            *lock(state) = SessionState::DriftDetected;
            let baseline = sync_until_ready(name, link, backoff, shutdown);
            *lock(state) = SessionState::Streaming;
            baseline
        })?;
        Some(Frame::new(payload, captured_at, meta.is_night_mode))
    }

    fn sync_until_ready(&self) -> Option<DateTime<Utc>> {
        sync_until_ready(
            &self.name,
            &self.link,
            self.timing.sync_backoff,
            &self.shutdown,
        )
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::debug!("camera {}: {:?} -> {:?}", self.name, *state, next);
            *state = next;
        }
    }
}

/// Retries clock sync until it succeeds. `None` means shutdown was requested.
fn sync_until_ready<L: CameraLink + ?Sized>(
    name: &str,
    link: &L,
    backoff: Duration,
    shutdown: &Shutdown,
) -> Option<DateTime<Utc>> {
    loop {
        if shutdown.is_requested() {
            return None;
        }
        match link.sync_clock() {
            Ok(baseline) => {
                log::info!("camera {}: clock synchronized, baseline {}", name, baseline);
                return Some(baseline);
            }
            Err(err) => {
                log::warn!("camera {}: {}; retrying in {:?}", name, err, backoff);
                if !shutdown.sleep(backoff) {
                    return None;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Stall watchdog
// ----------------------------------------------------------------------------

/// Closes the live connection when no frame was decoded during a whole period.
///
/// Each `arm` starts a new generation. A check only closes the connection of
/// the generation it started observing, so a reconnect racing a check is
/// never torn down by it.
#[derive(Debug, Default)]
struct StallWatchdog {
    alive: AtomicBool,
    tripped: AtomicBool,
    slot: Mutex<WatchedConnection>,
}

#[derive(Debug, Default)]
struct WatchedConnection {
    generation: u64,
    closer: Option<ConnectionCloser>,
}

impl StallWatchdog {
    fn spawn_checker(self: &Arc<Self>, name: &str, period: Duration) -> PeriodicTask {
        let watchdog = Arc::clone(self);
        let name = name.to_string();
        PeriodicTask::spawn(format!("camera {} watchdog", name), period, move || {
            watchdog.check(&name, period)
        })
    }

    fn check(&self, name: &str, period: Duration) {
        let seen = self.generation();
        if self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.expire(seen, name, period);
    }

    fn generation(&self) -> u64 {
        lock(&self.slot).generation
    }

    /// Closes the connection of generation `seen`, if it is still the live one.
    fn expire(&self, seen: u64, name: &str, period: Duration) {
        let slot = lock(&self.slot);
        if slot.generation != seen {
            return;
        }
        if let Some(closer) = &slot.closer {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                log::warn!("camera {}: no frame within {:?}, closing stream", name, period);
            }
            closer.close();
        }
    }

    fn arm(&self, closer: ConnectionCloser) {
        let mut slot = lock(&self.slot);
        slot.generation = slot.generation.wrapping_add(1);
        slot.closer = Some(closer);
        self.tripped.store(false, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
    }

    fn feed(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Forgets the live connection and closes it.
    fn disarm(&self) {
        let closer = lock(&self.slot).closer.take();
        self.tripped.store(false, Ordering::SeqCst);
        if let Some(closer) = closer {
            closer.close();
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

pub struct SessionHandle {
    name: String,
    state: Arc<Mutex<SessionState>>,
    watchdog: Arc<StallWatchdog>,
    shutdown: Shutdown,
    join: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Requests shutdown, closes the live connection and waits for the session.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.request();
        self.watchdog.disarm();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("camera {} session thread panicked", self.name))?;
        }
        Ok(())
    }
}
