//! Camera clock baseline estimation and frame timestamping.
//!
//! A camera only reports how long it has been powered on. The baseline is the
//! wall-clock instant at which that counter was zero, estimated as
//! `sent_at + round_trip / 2 - uptime` from the fastest of a few probes.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::{Duration, Instant};

use crate::error::CameraError;

/// Probes per synchronization.
pub const SYNC_ATTEMPTS: usize = 5;

/// Client timeout for a single uptime probe.
pub const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Probes this slow are never used for the baseline.
const MAX_ROUND_TRIP: Duration = Duration::from_secs(10);

/// One request to the camera's uptime endpoint.
pub trait UptimeProbe {
    fn uptime_millis(&self) -> Result<u64, CameraError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSample {
    pub sent_at: DateTime<Utc>,
    pub round_trip: Duration,
    pub uptime_ms: u64,
}

impl SyncSample {
    pub fn baseline(&self) -> Option<DateTime<Utc>> {
        let half_trip = TimeDelta::from_std(self.round_trip / 2).ok()?;
        let uptime = TimeDelta::try_milliseconds(i64::try_from(self.uptime_ms).ok()?)?;
        self.sent_at
            .checked_add_signed(half_trip)?
            .checked_sub_signed(uptime)
    }
}

/// Baseline from the sample with the shortest round trip.
pub fn best_baseline(samples: &[SyncSample]) -> Option<DateTime<Utc>> {
    samples
        .iter()
        .filter(|sample| sample.round_trip < MAX_ROUND_TRIP)
        .filter(|sample| sample.baseline().is_some())
        .min_by_key(|sample| sample.round_trip)
        .and_then(SyncSample::baseline)
}

/// Runs up to `SYNC_ATTEMPTS` probes and returns the best baseline.
pub fn synchronize<P: UptimeProbe + ?Sized>(
    probe: &P,
    address: &str,
) -> Result<DateTime<Utc>, CameraError> {
    let mut samples = Vec::with_capacity(SYNC_ATTEMPTS);
    for attempt in 1..=SYNC_ATTEMPTS {
        let sent_at = Utc::now();
        let started = Instant::now();
        let result = probe.uptime_millis();
        let round_trip = started.elapsed();
        match result {
            Ok(uptime_ms) => samples.push(SyncSample {
                sent_at,
                round_trip,
                uptime_ms,
            }),
            Err(err) => log::debug!("{}: uptime probe {} failed: {}", address, attempt, err),
        }
    }
    best_baseline(&samples).ok_or_else(|| CameraError::SyncUnavailable {
        address: address.to_string(),
        attempts: SYNC_ATTEMPTS,
    })
}

/// Converts capture offsets into wall-clock frame times.
///
/// A frame time earlier than the previous one, or a missing baseline, counts
/// as drift: the caller-supplied resync runs once and the time is recomputed
/// from the new baseline. The recomputed time is accepted as-is.
#[derive(Clone, Debug, Default)]
pub struct FrameClock {
    baseline: Option<DateTime<Utc>>,
    last_frame_time: Option<DateTime<Utc>>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> Option<DateTime<Utc>> {
        self.baseline
    }

    pub fn set_baseline(&mut self, baseline: DateTime<Utc>) {
        self.baseline = Some(baseline);
    }

    pub fn last_frame_time(&self) -> Option<DateTime<Utc>> {
        self.last_frame_time
    }

    /// Timestamps a frame. Returns `None` only if `resync` gives up.
    pub fn stamp(
        &mut self,
        capture_offset_ms: u64,
        resync: impl FnOnce() -> Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let mut frame_time = self.frame_time(capture_offset_ms);
        let drifted = match (frame_time, self.last_frame_time) {
            (None, _) => true,
            (Some(time), Some(last)) => time < last,
            (Some(_), None) => false,
        };
        if drifted {
            self.baseline = Some(resync()?);
            frame_time = self.frame_time(capture_offset_ms);
        }
        let frame_time = frame_time?;
        self.last_frame_time = Some(frame_time);
        Some(frame_time)
    }

    fn frame_time(&self, capture_offset_ms: u64) -> Option<DateTime<Utc>> {
        let offset = TimeDelta::try_milliseconds(i64::try_from(capture_offset_ms).ok()?)?;
        self.baseline?.checked_add_signed(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn sample(sent_ms: i64, rtt_ms: u64, uptime_ms: u64) -> SyncSample {
        SyncSample {
            sent_at: at(sent_ms),
            round_trip: Duration::from_millis(rtt_ms),
            uptime_ms,
        }
    }

    #[test]
    fn baseline_is_sent_plus_half_trip_minus_uptime() {
        let s = sample(1_000_000, 40, 600_000);
        assert_eq!(s.baseline(), Some(at(1_000_000 + 20 - 600_000)));
    }

    #[test]
    fn best_baseline_uses_fastest_sample() {
        let samples = [
            sample(1_000_000, 80, 500_000),
            sample(1_000_100, 30, 500_110),
            sample(1_000_200, 12, 500_190),
            sample(1_000_300, 45, 500_290),
            sample(1_000_400, 60, 500_400),
        ];
        assert_eq!(best_baseline(&samples), Some(at(1_000_200 + 6 - 500_190)));
    }

    #[test]
    fn best_baseline_ignores_very_slow_samples() {
        assert_eq!(best_baseline(&[sample(50_000, 10_000, 1_000)]), None);
        assert_eq!(best_baseline(&[]), None);
    }

    struct ScriptedProbe {
        replies: RefCell<VecDeque<Result<u64, CameraError>>>,
        calls: Cell<usize>,
    }

    impl ScriptedProbe {
        fn new(replies: Vec<Result<u64, CameraError>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                calls: Cell::new(0),
            }
        }
    }

    impl UptimeProbe for ScriptedProbe {
        fn uptime_millis(&self) -> Result<u64, CameraError> {
            self.calls.set(self.calls.get() + 1);
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(CameraError::StreamClosed))
        }
    }

    #[test]
    fn synchronize_survives_partial_failures() {
        let probe = ScriptedProbe::new(vec![
            Err(CameraError::Connect("refused".into())),
            Ok(90_000),
            Err(CameraError::Connect("timeout".into())),
        ]);
        let before = Utc::now();
        let baseline = synchronize(&probe, "10.0.0.1").unwrap();
        let after = Utc::now();
        assert_eq!(probe.calls.get(), SYNC_ATTEMPTS);
        assert!(baseline >= before - TimeDelta::milliseconds(90_000));
        assert!(baseline <= after - TimeDelta::milliseconds(90_000));
    }

    #[test]
    fn synchronize_fails_when_every_probe_fails() {
        let probe = ScriptedProbe::new(vec![]);
        match synchronize(&probe, "10.0.0.1") {
            Err(CameraError::SyncUnavailable { address, attempts }) => {
                assert_eq!(address, "10.0.0.1");
                assert_eq!(attempts, SYNC_ATTEMPTS);
            }
            other => panic!("expected sync failure, got {:?}", other),
        }
    }

    #[test]
    fn monotonic_offsets_never_resync() {
        let mut clock = FrameClock::new();
        clock.set_baseline(at(10_000));
        for offset in [100, 200, 200, 350] {
            let time = clock.stamp(offset, || panic!("unexpected resync"));
            assert_eq!(time, Some(at(10_000 + offset as i64)));
        }
        assert_eq!(clock.last_frame_time(), Some(at(10_350)));
    }

    #[test]
    fn backwards_frame_time_resyncs_exactly_once() {
        let mut clock = FrameClock::new();
        clock.set_baseline(at(10_000));
        clock.stamp(1_000, || None).unwrap();

        let resyncs = Cell::new(0);
        let time = clock.stamp(500, || {
            resyncs.set(resyncs.get() + 1);
            Some(at(10_700))
        });
        assert_eq!(resyncs.get(), 1);
        assert_eq!(time, Some(at(11_200)));
        assert_eq!(clock.baseline(), Some(at(10_700)));
        assert_eq!(clock.last_frame_time(), Some(at(11_200)));
    }

    #[test]
    fn missing_baseline_resyncs_before_first_frame() {
        let mut clock = FrameClock::new();
        let resyncs = Cell::new(0);
        let time = clock.stamp(250, || {
            resyncs.set(resyncs.get() + 1);
            Some(at(5_000))
        });
        assert_eq!(resyncs.get(), 1);
        assert_eq!(time, Some(at(5_250)));
    }

    #[test]
    fn still_early_after_resync_is_accepted() {
        let mut clock = FrameClock::new();
        clock.set_baseline(at(10_000));
        clock.stamp(1_000, || None).unwrap();
        let time = clock.stamp(100, || Some(at(10_000)));
        assert_eq!(time, Some(at(10_100)));
        assert_eq!(clock.last_frame_time(), Some(at(10_100)));
    }

    #[test]
    fn abandoned_resync_yields_no_timestamp() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.stamp(100, || None), None);
        assert_eq!(clock.last_frame_time(), None);
    }
}
