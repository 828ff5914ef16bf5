//! GPS fixes keyed by time of day.
//!
//! Keys keep only hour, minute and second (UTC). Two fixes taken at the same
//! clock second on different days share a key, and the first one stored wins.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{Stamped, TimeKeyedStore};
use crate::error::GpsNotFound;
use crate::task::PeriodicTask;

#[derive(Clone, Debug, PartialEq)]
pub struct GpsFix<P> {
    pub time_of_day: NaiveTime,
    /// Full instant of the fix; only used to age the entry.
    pub fixed_at: DateTime<Utc>,
    pub payload: P,
}

impl<P> Stamped for GpsFix<P> {
    fn stamped_at(&self) -> DateTime<Utc> {
        self.fixed_at
    }
}

/// Answer to a GPS lookup, tagged with the id of the request it answers.
#[derive(Clone, Debug, PartialEq)]
pub struct GpsReply<P> {
    pub request_id: u32,
    pub fix: Result<GpsFix<P>, GpsNotFound>,
}

pub struct GpsLookup<P> {
    store: Arc<TimeKeyedStore<NaiveTime, GpsFix<P>>>,
}

impl<P> Default for GpsLookup<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> GpsLookup<P> {
    pub fn new() -> Self {
        Self {
            store: Arc::new(TimeKeyedStore::new("gps buffer")),
        }
    }

    /// Buffers a fix. Returns `false` if a fix for the same second of day is
    /// already buffered.
    pub fn record(&self, fixed_at: DateTime<Utc>, payload: P) -> bool {
        let time_of_day = time_of_day_key(fixed_at);
        self.store.insert(
            time_of_day,
            GpsFix {
                time_of_day,
                fixed_at,
                payload,
            },
        )
    }

    /// Finds the fix recorded at the same second of day as `at`.
    pub fn lookup(&self, request_id: u32, at: DateTime<Utc>) -> GpsReply<P>
    where
        P: Clone,
    {
        let fix = self.store.lookup(&time_of_day_key(at)).ok_or(GpsNotFound);
        if fix.is_err() {
            log::debug!("gps lookup {}: no fix for {}", request_id, at.time());
        }
        GpsReply { request_id, fix }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.store.sweep(now)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl<P: Send + 'static> GpsLookup<P> {
    pub fn spawn_sweeper(&self, period: Duration) -> PeriodicTask {
        self.store.spawn_sweeper(period)
    }
}

/// Drops the date and sub-second part of `at`.
pub fn time_of_day_key(at: DateTime<Utc>) -> NaiveTime {
    let time = at.time();
    NaiveTime::from_num_seconds_from_midnight_opt(time.num_seconds_from_midnight(), 0)
        .unwrap_or(time)
}
