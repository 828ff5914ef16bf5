//! Short-lived keyed buffers with periodic eviction.
//!
//! `TimeKeyedStore` is a single-mutex map with first-write-wins inserts and a
//! sweep that drops entries older than a retention window. `PlateGate` and
//! `GpsLookup` are the two specialisations used downstream of correlation.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::task::PeriodicTask;

pub mod gps;
pub mod plate;

pub use gps::{GpsFix, GpsLookup, GpsReply};
pub use plate::{PlateGate, PlateRecord};

/// Entries older than this many minutes are removed by the sweep.
pub const RETENTION_MINUTES: i64 = 60;

/// How often the background sweeper runs.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Values that know the instant they were recorded for.
pub trait Stamped {
    fn stamped_at(&self) -> DateTime<Utc>;
}

pub struct TimeKeyedStore<K, V> {
    name: &'static str,
    retention: TimeDelta,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> TimeKeyedStore<K, V>
where
    K: Eq + Hash + Debug,
    V: Stamped,
{
    pub fn new(name: &'static str) -> Self {
        Self::with_retention(name, TimeDelta::minutes(RETENTION_MINUTES))
    }

    pub fn with_retention(name: &'static str, retention: TimeDelta) -> Self {
        Self {
            name,
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stores `value` unless `key` is already present. Returns whether it was stored.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            log::debug!("{}: {:?} already buffered", self.name, key);
            return false;
        }
        entries.insert(key, value);
        true
    }

    /// Inserts `value` if `key` is absent and returns `None`; otherwise runs
    /// `inspect` on the stored value under the same lock.
    pub fn inspect_or_insert<T>(
        &self,
        key: K,
        value: V,
        inspect: impl FnOnce(&V) -> T,
    ) -> Option<T> {
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(existing) => Some(inspect(existing)),
            None => {
                entries.insert(key, value);
                None
            }
        }
    }

    /// Exact-key lookup.
    pub fn lookup(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry older than the retention window at `now`.
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, value| now - value.stamped_at() <= self.retention);
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("{}: swept {} stale entries", self.name, removed);
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> TimeKeyedStore<K, V>
where
    K: Eq + Hash + Debug + Send + 'static,
    V: Stamped + Send + 'static,
{
    /// Starts the background sweep against the wall clock.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> PeriodicTask {
        let store = Arc::clone(self);
        PeriodicTask::spawn(format!("{} sweeper", self.name), period, move || {
            store.sweep(Utc::now());
        })
    }
}
