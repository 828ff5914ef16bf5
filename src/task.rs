//! Background task plumbing: a shared shutdown flag and a cancellable
//! periodic thread.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Process-lifetime stop flag shared between a loop and whoever owns it.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early when shutdown is requested.
    /// Returns `false` if the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

/// A thread that runs `tick` once per period until stopped.
///
/// The first tick happens one full period after spawn.
pub struct PeriodicTask {
    name: String,
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = name.clone();
        let join = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => tick(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::debug!("{} stopped", thread_name);
                    break;
                }
            }
        });
        Self {
            name,
            stop: Some(stop_tx),
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the task and waits for the in-flight tick, if any.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} thread panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("{}", err);
        }
    }
}
