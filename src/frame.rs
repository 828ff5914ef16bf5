//! Timestamped frames and the panoramic frame ring.
//!
//! - `Frame`: an opaque image payload with its camera-derived capture time.
//! - `FrameRing`: fixed-capacity circular buffer with nearest-time lookup.
//!
//! Frames are shared as `Arc<Frame>` so a ring slot and a correlation result
//! can point at the same payload.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::FrameNotFound;

/// A decoded camera image. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    captured_at: DateTime<Utc>,
    is_night_mode: bool,
}

impl Frame {
    pub fn new(payload: Vec<u8>, captured_at: DateTime<Utc>, is_night_mode: bool) -> Self {
        Self {
            payload,
            captured_at,
            is_night_mode,
        }
    }

    /// Raw image bytes as extracted from the stream.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn is_night_mode(&self) -> bool {
        self.is_night_mode
    }
}

// ----------------------------------------------------------------------------
// FrameRing
// ----------------------------------------------------------------------------

/// Fixed-capacity ring of frames ordered by arrival.
///
/// Producers must add frames in non-decreasing capture order; the nearest
/// lookup relies on it and does not check it.
///
/// Lookups never fail for out-of-range times: a query before the oldest frame
/// resolves to the oldest, one after the newest resolves to the newest. Range
/// validity is the caller's concern (see `correlate::CorrelationWindow`).
pub struct FrameRing {
    capacity: usize,
    state: Mutex<RingState>,
}

struct RingState {
    /// `capacity + 1` slots; one is always free so `write == read` means empty.
    slots: Vec<Option<Arc<Frame>>>,
    write: usize,
    read: usize,
}

impl RingState {
    fn modulus(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        if self.write < self.read {
            self.modulus() + self.write - self.read
        } else {
            self.write - self.read
        }
    }

    fn slot(&self, position: usize) -> usize {
        (self.read + position) % self.modulus()
    }

    fn frame(&self, position: usize) -> Option<&Arc<Frame>> {
        self.slots[self.slot(position)].as_ref()
    }

    fn time(&self, position: usize) -> DateTime<Utc> {
        // Live slots are always occupied.
        self.frame(position)
            .map(|frame| frame.captured_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn push(&mut self, frame: Arc<Frame>) {
        let write = self.write;
        self.slots[write] = Some(frame);
        self.write = (write + 1) % self.modulus();
        if self.write == self.read {
            let evicted = self.read;
            self.slots[evicted] = None;
            self.read = (evicted + 1) % self.modulus();
        }
    }

    fn find_nearest(&self, t: DateTime<Utc>) -> Result<usize, FrameNotFound> {
        let len = self.len();
        if len == 0 {
            return Err(FrameNotFound);
        }
        let oldest = self.time(0);
        let span = micros(self.time(len - 1) - oldest);
        if span == 0 {
            return Ok(0);
        }

        let last = (len - 1) as i128;
        let estimate = (last * micros(t - oldest) / span).clamp(0, last) as usize;

        let mut held = estimate;
        if self.time(held) < t {
            loop {
                let next = held + 1;
                if next == len {
                    return Ok(held);
                }
                if self.time(next) < t {
                    held = next;
                    continue;
                }
                let after = micros(self.time(next) - t);
                let before = micros(t - self.time(held));
                return Ok(if after < before { next } else { held });
            }
        }

        loop {
            if held == 0 {
                return Ok(held);
            }
            let prev = held - 1;
            if self.time(prev) > t {
                held = prev;
                continue;
            }
            let after = micros(self.time(held) - t);
            let before = micros(t - self.time(prev));
            return Ok(if after < before { held } else { prev });
        }
    }
}

impl FrameRing {
    /// Creates a ring holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(RingState {
                slots: vec![None; capacity + 1],
                write: 0,
                read: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a frame, dropping the oldest one when the ring is full.
    pub fn add(&self, frame: impl Into<Arc<Frame>>) {
        self.lock().push(frame.into());
    }

    /// Number of live frames.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position (0 = oldest live frame) of the frame captured closest to `t`.
    ///
    /// Interpolates an estimate from the buffered time span, then walks toward
    /// `t` until it is bracketed. Ties go to the earlier frame.
    pub fn find_nearest(&self, t: DateTime<Utc>) -> Result<usize, FrameNotFound> {
        self.lock().find_nearest(t)
    }

    /// Frame at a position returned by `find_nearest`.
    pub fn frame_at(&self, position: usize) -> Option<Arc<Frame>> {
        let state = self.lock();
        if position >= state.len() {
            return None;
        }
        state.frame(position).cloned()
    }

    /// Frame captured closest to `t`.
    pub fn frame(&self, t: DateTime<Utc>) -> Result<Arc<Frame>, FrameNotFound> {
        let state = self.lock();
        let position = state.find_nearest(t)?;
        state.frame(position).cloned().ok_or(FrameNotFound)
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn micros(delta: TimeDelta) -> i128 {
    match delta.num_microseconds() {
        Some(us) => us as i128,
        None => delta.num_milliseconds() as i128 * 1_000,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn frame_at_ms(ms: i64) -> Frame {
        Frame::new(ms.to_le_bytes().to_vec(), at(ms), false)
    }

    fn ring_with(capacity: usize, times: &[i64]) -> FrameRing {
        let ring = FrameRing::new(capacity);
        for &t in times {
            ring.add(frame_at_ms(t));
        }
        ring
    }

    fn brute_force_nearest(times: &[i64], t: i64) -> usize {
        let mut best = 0;
        for (i, &candidate) in times.iter().enumerate() {
            if (candidate - t).abs() < (times[best] - t).abs() {
                best = i;
            }
        }
        best
    }

    #[test]
    fn len_never_exceeds_capacity_and_oldest_survivor_is_k_minus_n() {
        let capacity = 7;
        let ring = FrameRing::new(capacity);
        for k in 1..=40i64 {
            ring.add(frame_at_ms(k * 10));
            assert!(ring.len() <= capacity);
            let expected_oldest = (k - capacity as i64).max(0) + 1;
            let oldest = ring.frame_at(0).unwrap();
            assert_eq!(oldest.captured_at(), at(expected_oldest * 10));
        }
        assert_eq!(ring.len(), capacity);
    }

    #[test]
    fn nearest_matches_brute_force_over_irregular_spacing() {
        let times = [0, 3, 40, 41, 90, 200, 205, 330, 331, 332, 900];
        let ring = ring_with(32, &times);
        for t in -50..1_000 {
            assert_eq!(
                ring.find_nearest(at(t)).unwrap(),
                brute_force_nearest(&times, t),
                "query t={}",
                t
            );
        }
    }

    #[test]
    fn nearest_after_wraparound() {
        let times: Vec<i64> = (0..25).map(|i| i * 33 + (i % 3)).collect();
        let ring = ring_with(10, &times);
        let live = &times[times.len() - 10..];
        for t in (live[0] - 100)..(live[9] + 100) {
            assert_eq!(ring.find_nearest(at(t)).unwrap(), brute_force_nearest(live, t));
        }
    }

    #[test]
    fn ties_go_to_the_earlier_frame() {
        let ring = ring_with(8, &[100, 200, 300, 400]);
        assert_eq!(ring.find_nearest(at(150)).unwrap(), 0);
        assert_eq!(ring.find_nearest(at(250)).unwrap(), 1);
        assert_eq!(ring.find_nearest(at(350)).unwrap(), 2);
    }

    #[test]
    fn empty_ring_is_not_found() {
        let ring = FrameRing::new(4);
        assert_eq!(ring.find_nearest(at(0)), Err(FrameNotFound));
        assert!(ring.frame(at(0)).is_err());
        assert!(ring.is_empty());
    }

    #[test]
    fn single_entry_answers_every_query() {
        let ring = ring_with(4, &[500]);
        for t in [-10_000, 0, 499, 500, 501, 1_000_000] {
            assert_eq!(ring.find_nearest(at(t)).unwrap(), 0);
            assert_eq!(ring.frame(at(t)).unwrap().captured_at(), at(500));
        }
    }

    #[test]
    fn equal_timestamps_return_oldest() {
        let ring = ring_with(4, &[70, 70, 70]);
        assert_eq!(ring.find_nearest(at(0)).unwrap(), 0);
        assert_eq!(ring.find_nearest(at(1_000)).unwrap(), 0);
    }

    #[test]
    fn out_of_range_queries_clamp_to_boundaries() {
        let ring = ring_with(4, &[100, 200, 300]);
        assert_eq!(ring.find_nearest(at(-5_000)).unwrap(), 0);
        assert_eq!(ring.find_nearest(at(5_000)).unwrap(), 2);
    }

    #[test]
    fn frame_at_rejects_positions_past_len() {
        let ring = ring_with(4, &[100, 200]);
        assert!(ring.frame_at(1).is_some());
        assert!(ring.frame_at(2).is_none());
    }
}
