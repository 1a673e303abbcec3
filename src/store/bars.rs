//! Keyed cache of pre-computed bars.
//!
//! Key: `(topic, resolution, bar_start)`. The scheduler is the main writer;
//! the read path consults this store before falling back to on-demand
//! projection.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::models::{Bar, Resolution};

pub struct BarStore {
    /// `(topic, resolution)` -> bars ordered by start timestamp.
    inner: RwLock<HashMap<(String, Resolution), BTreeMap<i64, Bar>>>,
    max_bars_per_resolution: usize,
}

impl BarStore {
    pub fn new(max_bars_per_resolution: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_bars_per_resolution,
        }
    }

    /// Upsert a bar at its `(topic, resolution, start)` key.
    ///
    /// A summary-bearing bar supersedes a stored summary-less one; a
    /// summary-less incoming bar never erases a stored summary. Past the
    /// per-key retention cap the oldest bars are evicted.
    pub fn put(&self, bar: Bar) {
        let key = (bar.topic.clone(), bar.resolution);
        let start_ts = bar.start.timestamp();

        let mut inner = self.inner.write();
        let slot = inner.entry(key).or_default();

        if let Some(existing) = slot.get(&start_ts) {
            if existing.summary.is_some() && bar.summary.is_none() {
                return;
            }
        }
        slot.insert(start_ts, bar);

        while slot.len() > self.max_bars_per_resolution {
            slot.pop_first();
        }
    }

    /// Up to `limit` bars for the key, most recent first.
    pub fn get(&self, topic: &str, resolution: Resolution, limit: usize) -> Vec<Bar> {
        let inner = self.inner.read();
        let Some(slot) = inner.get(&(topic.to_string(), resolution)) else {
            return Vec::new();
        };
        slot.values().rev().take(limit).cloned().collect()
    }

    pub fn get_latest(&self, topic: &str, resolution: Resolution) -> Option<Bar> {
        let inner = self.inner.read();
        inner
            .get(&(topic.to_string(), resolution))?
            .last_key_value()
            .map(|(_, bar)| bar.clone())
    }

    /// Whether a summary-bearing bar already exists at the key.
    pub fn has_summary(&self, topic: &str, resolution: Resolution, start_ts: i64) -> bool {
        let inner = self.inner.read();
        inner
            .get(&(topic.to_string(), resolution))
            .and_then(|slot| slot.get(&start_ts))
            .map(|bar| bar.summary.is_some())
            .unwrap_or(false)
    }

    /// Drop every bar for the topic across all resolutions.
    pub fn clear(&self, topic: &str) {
        let mut inner = self.inner.write();
        inner.retain(|(t, _), _| t != topic);
    }
}
