//! Latest-reading store shared between the poller and HTTP handlers.
//!
//! Exactly one writer (the polling worker) and any number of concurrent
//! readers. A slot exists for every configured unit id from startup and
//! stays empty until the first successful read. Slots are replaced as whole
//! values, so a snapshot can never mix fields from two different reads.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One successful register read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Raw holding register content.
    pub raw_value: u16,
    /// Calibrated fill percentage, 0-100.
    pub percent: u8,
    /// Instant of the successful read.
    pub timestamp: DateTime<Utc>,
}

/// Derived availability of a silo.
///
/// Never stored; computed on the read path from the last-success timestamp
/// and the staleness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiloStatus {
    /// A successful read arrived within the staleness threshold.
    Online,
    /// The last successful read is older than the staleness threshold.
    Offline,
    /// No successful read since startup.
    NeverRead,
}

impl SiloStatus {
    /// Derive the status from the last successful read, if any.
    pub fn derive(reading: Option<&Reading>, now: DateTime<Utc>, staleness: Duration) -> Self {
        let Some(reading) = reading else {
            return SiloStatus::NeverRead;
        };

        let threshold = TimeDelta::from_std(staleness).unwrap_or(TimeDelta::MAX);
        if now.signed_duration_since(reading.timestamp) < threshold {
            SiloStatus::Online
        } else {
            SiloStatus::Offline
        }
    }

    /// String name used in the JSON API.
    pub fn as_str(&self) -> &'static str {
        match self {
            SiloStatus::Online => "online",
            SiloStatus::Offline => "offline",
            SiloStatus::NeverRead => "never_read",
        }
    }
}

impl std::fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table of the most recent reading per configured silo.
#[derive(Debug)]
pub struct ReadingStore {
    slots: RwLock<BTreeMap<u8, Option<Reading>>>,
}

/// Shared handle to a [`ReadingStore`].
pub type SharedStore = Arc<ReadingStore>;

impl ReadingStore {
    /// Create a store with one empty slot per configured unit id.
    pub fn new(unit_ids: impl IntoIterator<Item = u8>) -> Self {
        let slots = unit_ids.into_iter().map(|id| (id, None)).collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Latest reading for a silo, or `None` if it has never been read.
    pub fn get(&self, unit_id: u8) -> Option<Reading> {
        self.slots.read().get(&unit_id).copied().flatten()
    }

    /// Replace a silo's reading. Called only by the polling worker.
    ///
    /// Ids outside the configured set are logged and dropped; the slot set
    /// is fixed at startup.
    pub fn put(&self, unit_id: u8, reading: Reading) {
        let mut slots = self.slots.write();
        match slots.get_mut(&unit_id) {
            Some(slot) => *slot = Some(reading),
            None => warn!(unit = unit_id, "dropping reading for unconfigured unit id"),
        }
    }

    /// Coherent snapshot of every slot, ascending by unit id.
    pub fn snapshot(&self) -> Vec<(u8, Option<Reading>)> {
        self.slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, *slot))
            .collect()
    }

    /// Number of configured slots.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// True when no silos are configured.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}
