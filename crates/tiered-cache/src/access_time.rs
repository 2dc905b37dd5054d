//! Approximate last-access times used to rank eviction candidates.
//!
//! Timestamps are quantized to whole seconds since the UNIX epoch and stored
//! as `u32`. Quantization always rounds up, so an estimate is never earlier
//! than the time that was recorded: a key that was just touched can never look
//! older than it is.

use crate::error::CacheError;
use crate::util::{bincode_deserialize, bincode_serialize};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct AccessTimeTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    table: IndexMap<String, u32>,
    dirty: bool,
}

impl AccessTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an access of `key` at `now`.
    ///
    /// Estimates only move forward: an earlier `now` than the stored value is
    /// ignored.
    pub fn add_timestamp(&self, key: &str, now: SystemTime) {
        let quantized = quantize(now);
        let mut state = self.inner.lock();
        match state.table.get_mut(key) {
            Some(existing) if *existing >= quantized => {}
            Some(existing) => {
                *existing = quantized;
                state.dirty = true;
            }
            None => {
                state.table.insert(key.to_owned(), quantized);
                state.dirty = true;
            }
        }
    }

    pub fn estimate_timestamp(&self, key: &str) -> Option<SystemTime> {
        let secs = *self.inner.lock().table.get(key)?;
        Some(dequantize(secs))
    }

    pub fn remove_timestamp(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        let removed = state.table.swap_remove(key).is_some();
        if removed {
            state.dirty = true;
        }
        removed
    }

    /// Removes `key` unless its estimate moved past `seen`, an estimate read
    /// before the backing file was deleted. An entry that appeared after
    /// `seen == None` belongs to a newer write and is kept.
    pub(crate) fn remove_timestamp_if_not_newer(
        &self,
        key: &str,
        seen: Option<SystemTime>,
    ) -> bool {
        let Some(seen) = seen.map(quantize) else {
            return false;
        };
        let mut state = self.inner.lock();
        match state.table.get(key) {
            Some(current) if *current <= seen => {
                state.table.swap_remove(key);
                state.dirty = true;
                true
            }
            _ => false,
        }
    }

    /// Keeps only the keys for which `keep` returns `true`.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut state = self.inner.lock();
        let before = state.table.len();
        state.table.retain(|key, _| keep(key));
        let removed = before - state.table.len();
        if removed > 0 {
            state.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().table.is_empty()
    }

    /// `true` when the table changed since the last [`Self::deserialize`] or
    /// [`Self::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    pub fn mark_clean(&self) {
        self.inner.lock().dirty = false;
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.lock().dirty = true;
    }

    /// Encodes the whole table: entry count, then `(key, seconds)` pairs.
    pub fn serialize(&self) -> Result<Vec<u8>, CacheError> {
        let state = self.inner.lock();
        let entries: Vec<(&str, u32)> = state
            .table
            .iter()
            .map(|(key, secs)| (key.as_str(), *secs))
            .collect();
        bincode_serialize(&entries)
    }

    /// Replaces the table with the contents of `bytes`.
    ///
    /// On error the current table is left unchanged.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<(), CacheError> {
        let entries: Vec<(String, u32)> = bincode_deserialize(bytes)?;
        let mut table = IndexMap::with_capacity(entries.len());
        for (key, secs) in entries {
            // Duplicate keys keep the most recent estimate.
            let slot = table.entry(key).or_insert(secs);
            *slot = (*slot).max(secs);
        }

        let mut state = self.inner.lock();
        state.table = table;
        state.dirty = false;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let tracker = Self::new();
        tracker.deserialize(bytes)?;
        Ok(tracker)
    }
}

fn quantize(ts: SystemTime) -> u32 {
    let since_epoch = ts.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let mut secs = since_epoch.as_secs();
    if since_epoch.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    u32::try_from(secs).unwrap_or(u32::MAX)
}

fn dequantize(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}
