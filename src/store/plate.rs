//! Plate dedup with cooldown.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{Stamped, TimeKeyedStore};
use crate::task::PeriodicTask;

/// A recognised plate and the zoom frame time it was read from.
///
/// `recognition` is the plate engine's result, stored as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateRecord<R> {
    pub plate: String,
    pub recognition: R,
    pub frame_time: DateTime<Utc>,
}

impl<R> Stamped for PlateRecord<R> {
    fn stamped_at(&self) -> DateTime<Utc> {
        self.frame_time
    }
}

/// Decides when a repeated plate detection becomes actionable.
///
/// The first sighting is stored and reported as not actionable. Later
/// sightings become actionable once more than `cooldown` has passed since the
/// stored sighting. The stored record is neither refreshed nor removed when a
/// sighting is actionable, so every sighting after the cooldown stays
/// actionable until the 60-minute sweep drops the record.
pub struct PlateGate<R> {
    store: Arc<TimeKeyedStore<String, PlateRecord<R>>>,
    cooldown: TimeDelta,
}

impl<R> PlateGate<R> {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            store: Arc::new(TimeKeyedStore::new("plate buffer")),
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn cooldown(&self) -> TimeDelta {
        self.cooldown
    }

    /// Records `record` if its plate is unseen; otherwise reports whether the
    /// cooldown has elapsed between the stored sighting and this one.
    pub fn check(&self, record: PlateRecord<R>) -> bool {
        let now = record.frame_time;
        let plate = record.plate.clone();
        let cooldown = self.cooldown;
        match self
            .store
            .inspect_or_insert(plate, record, |stored| now - stored.frame_time > cooldown)
        {
            None => false,
            Some(actionable) => {
                if actionable {
                    log::info!("plate gate: plate cleared cooldown");
                }
                actionable
            }
        }
    }

    pub fn lookup(&self, plate: &str) -> Option<PlateRecord<R>>
    where
        R: Clone,
    {
        self.store.lookup(&plate.to_string())
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

impl<R: Send + 'static> PlateGate<R> {
    pub fn spawn_sweeper(&self, period: Duration) -> PeriodicTask {
        self.store.spawn_sweeper(period)
    }
}
