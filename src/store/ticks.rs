//! Per-topic deduplicated, time-indexed tick container.
//!
//! Ticks are the source of truth for all bar projections. Each topic owns an
//! independent container behind its own lock; the outer map is only touched
//! to look up or create a topic entry, so topic-map changes never invalidate
//! in-flight per-topic operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::models::Tick;

#[derive(Default)]
struct TopicTicks {
    /// (timestamp, id) -> tick; ascending time order with id tiebreak.
    by_time: BTreeMap<(DateTime<Utc>, String), Tick>,
    /// Exact-id dedup set.
    ids: HashSet<String>,
}

impl TopicTicks {
    fn prune_to(&mut self, max: usize) {
        while self.by_time.len() > max {
            if let Some(((_, id), _)) = self.by_time.pop_first() {
                self.ids.remove(&id);
            }
        }
    }
}

pub struct TickStore {
    topics: RwLock<HashMap<String, Arc<Mutex<TopicTicks>>>>,
    max_per_topic: usize,
}

impl TickStore {
    pub fn new(max_per_topic: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            max_per_topic,
        }
    }

    fn topic_entry(&self, topic: &str) -> Arc<Mutex<TopicTicks>> {
        if let Some(entry) = self.topics.read().get(topic) {
            return entry.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TopicTicks::default())))
            .clone()
    }

    /// Insert ticks not already present, keyed by id. Returns the number of
    /// newly accepted ticks. The whole batch becomes visible atomically;
    /// afterwards the topic holds at most `max_per_topic` ticks, pruned
    /// oldest-first.
    pub fn add(&self, topic: &str, ticks: Vec<Tick>) -> usize {
        let entry = self.topic_entry(topic);
        let mut state = entry.lock();

        let mut accepted = 0;
        for tick in ticks {
            if state.ids.contains(&tick.id) {
                continue;
            }
            state.ids.insert(tick.id.clone());
            state
                .by_time
                .insert((tick.timestamp, tick.id.clone()), tick);
            accepted += 1;
        }

        state.prune_to(self.max_per_topic);
        accepted
    }

    /// Ticks whose timestamp falls in the half-open `[start, end)` interval
    /// (either bound optional), ascending by timestamp with id tiebreak.
    pub fn get(
        &self,
        topic: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Tick> {
        let Some(entry) = self.topics.read().get(topic).cloned() else {
            return Vec::new();
        };
        let state = entry.lock();

        let lower = match start {
            Some(s) => Bound::Included((s, String::new())),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(e) => Bound::Excluded((e, String::new())),
            None => Bound::Unbounded,
        };

        state
            .by_time
            .range((lower, upper))
            .map(|(_, tick)| tick.clone())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.lock().by_time.len())
            .unwrap_or(0)
    }

    /// Oldest and newest tick timestamps, when any ticks exist.
    pub fn time_range(&self, topic: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let entry = self.topics.read().get(topic).cloned()?;
        let state = entry.lock();
        let oldest = state.by_time.first_key_value()?.0 .0;
        let newest = state.by_time.last_key_value()?.0 .0;
        Some((oldest, newest))
    }

    pub fn clear(&self, topic: &str) {
        if let Some(entry) = self.topics.read().get(topic).cloned() {
            let mut state = entry.lock();
            state.by_time.clear();
            state.ids.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn tick(id: &str, secs: i64) -> Tick {
        Tick {
            id: id.to_string(),
            author: "author".to_string(),
            text: format!("post {id}"),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            metrics: StdHashMap::new(),
            topic: "topic".to_string(),
        }
    }

    #[test]
    fn overlapping_polls_dedup_by_id() {
        let store = TickStore::new(100);
        let first: Vec<_> = (0..5).map(|i| tick(&format!("t{i}"), 100 + i)).collect();
        let second: Vec<_> = (3..8).map(|i| tick(&format!("t{i}"), 100 + i)).collect();

        assert_eq!(store.add("x", first), 5);
        assert_eq!(store.add("x", second), 3);
        assert_eq!(store.count("x"), 8);
    }

    #[test]
    fn repeated_add_is_a_no_op() {
        let store = TickStore::new(100);
        let batch: Vec<_> = (0..4).map(|i| tick(&format!("t{i}"), 100 + i)).collect();

        assert_eq!(store.add("x", batch.clone()), 4);
        assert_eq!(store.add("x", batch), 0);
        assert_eq!(store.count("x"), 4);
    }

    #[test]
    fn get_window_is_half_open_and_sorted() {
        let store = TickStore::new(100);
        store.add(
            "x",
            vec![tick("b", 120), tick("a", 120), tick("c", 60), tick("d", 180)],
        );

        let window = store.get(
            "x",
            Some(Utc.timestamp_opt(60, 0).unwrap()),
            Some(Utc.timestamp_opt(180, 0).unwrap()),
        );
        let ids: Vec<_> = window.iter().map(|t| t.id.as_str()).collect();
        // Ascending by timestamp, id tiebreak; end excluded.
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn retention_prunes_oldest() {
        let store = TickStore::new(3);
        store.add(
            "x",
            (0..5).map(|i| tick(&format!("t{i}"), 100 + i)).collect(),
        );

        assert_eq!(store.count("x"), 3);
        let remaining = store.get("x", None, None);
        let ids: Vec<_> = remaining.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3", "t4"]);

        // A pruned id may be re-accepted later.
        assert_eq!(store.add("x", vec![tick("t0", 200)]), 1);
    }

    #[test]
    fn time_range_and_clear() {
        let store = TickStore::new(100);
        assert!(store.time_range("x").is_none());

        store.add("x", vec![tick("a", 50), tick("b", 90)]);
        let (oldest, newest) = store.time_range("x").unwrap();
        assert_eq!(oldest, Utc.timestamp_opt(50, 0).unwrap());
        assert_eq!(newest, Utc.timestamp_opt(90, 0).unwrap());

        store.clear("x");
        assert_eq!(store.count("x"), 0);
        assert!(store.time_range("x").is_none());
    }

    #[test]
    fn topics_are_independent() {
        let store = TickStore::new(100);
        store.add("a", vec![tick("t1", 10)]);
        store.add("b", vec![tick("t1", 10)]);

        assert_eq!(store.count("a"), 1);
        assert_eq!(store.count("b"), 1);
        store.clear("a");
        assert_eq!(store.count("b"), 1);
    }
}
