//! gate_syncd - two-camera frame synchronization daemon
//!
//! This daemon:
//! 1. Runs a session per camera (panoramic and zoom)
//! 2. Buffers panoramic frames and answers correlation requests
//! 3. Issues one correlation request per zoom frame and logs the outcome
//! 4. Tallies matched and failed correlations until Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use gate_sync::{
    CameraSession, CorrelationError, CorrelationRequest, CorrelationResult, CorrelationService,
    FrameRing, GateSyncConfig, HttpCameraLink, ZoomForwarder, ZoomFrame,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dual-camera frame synchronization daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "GATE_SYNC_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = GateSyncConfig::load(args.config.as_deref()).context("load configuration")?;
    log::info!(
        "gate_syncd {} starting: panoramic {} zoom {} ring {} window [{} ms, {} ms]",
        env!("CARGO_PKG_VERSION"),
        config.panoramic.address,
        config.zoom.address,
        config.ring_capacity,
        config.window.min_ms,
        config.window.max_ms
    );

    let capacity = config.channel_capacity;
    let (pan_tx, pan_rx) = mpsc::sync_channel(capacity);
    let (zoom_tx, zoom_rx) = mpsc::sync_channel(capacity);
    let (forward_tx, forward_rx) = mpsc::sync_channel(capacity);
    let (request_tx, request_rx) = mpsc::sync_channel(capacity);
    let (result_tx, result_rx) = mpsc::sync_channel(capacity);

    let ring = Arc::new(FrameRing::new(config.ring_capacity));
    let correlation = CorrelationService::new(ring, config.window.correlation_window())
        .spawn(pan_rx, request_rx, result_tx);
    let forwarder = ZoomForwarder::new().spawn(zoom_rx, forward_tx);
    let requester = spawn_requester(forward_rx, request_tx);
    let reporter = spawn_reporter(result_rx);

    let panoramic = CameraSession::new("panoramic", HttpCameraLink::new(&config.panoramic)?)
        .spawn(pan_tx);
    let zoom = CameraSession::new("zoom", HttpCameraLink::new(&config.zoom)?).spawn(zoom_tx);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("gate_syncd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping camera sessions...");

    // Stopping the sessions closes every downstream channel in turn.
    panoramic.stop()?;
    zoom.stop()?;
    forwarder.join()?;
    join("requester", requester)?;
    correlation.join()?;
    let tally = reporter
        .join()
        .map_err(|_| anyhow!("reporter thread panicked"))?;

    log::info!(
        "gate_syncd stopped ({} matched, {} not found, {} too early, {} too late)",
        tally.matched,
        tally.not_found,
        tally.too_early,
        tally.too_late
    );
    Ok(())
}

/// Turns each zoom frame into a correlation request keyed by its zoom id.
fn spawn_requester(
    zoom_frames: Receiver<ZoomFrame>,
    requests: SyncSender<CorrelationRequest>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for zoom in zoom_frames {
            let request = CorrelationRequest {
                request_id: zoom.zoom_id,
                zoom_frame_time: zoom.frame.captured_at(),
            };
            if requests.send(request).is_err() {
                return;
            }
        }
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    matched: u64,
    not_found: u64,
    too_early: u64,
    too_late: u64,
}

impl Tally {
    fn record(&mut self, result: &CorrelationResult) {
        match &result.outcome {
            Ok(frame) => {
                self.matched += 1;
                log::debug!(
                    "request {}: panoramic frame at {}",
                    result.request_id,
                    frame.captured_at()
                );
            }
            Err(err) => {
                match err {
                    CorrelationError::NotFound => self.not_found += 1,
                    CorrelationError::TooEarly => self.too_early += 1,
                    CorrelationError::TooLate => self.too_late += 1,
                }
                log::debug!("request {}: {}", result.request_id, err);
            }
        }
    }
}

fn spawn_reporter(results: Receiver<CorrelationResult>) -> JoinHandle<Tally> {
    std::thread::spawn(move || {
        let mut tally = Tally::default();
        for result in results {
            tally.record(&result);
        }
        tally
    })
}

fn join(name: &str, handle: JoinHandle<()>) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("{} thread panicked", name))
}
