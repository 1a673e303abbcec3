//! Topic registry: lifecycle and state of watched-topic configurations.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;

use crate::models::{derive_topic_id, Resolution, Topic, TopicStatus};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("topic '{0}' already exists")]
    Conflict(String),
    #[error("topic '{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
}

pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Topic>>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new watched topic. The id is derived from the label and
    /// must be unique.
    pub fn add(
        &self,
        label: &str,
        query: &str,
        resolution: Resolution,
    ) -> Result<Topic, RegistryError> {
        let id = derive_topic_id(label);
        if id.is_empty() {
            return Err(RegistryError::InvalidArgument(format!(
                "label '{label}' produces an empty topic id"
            )));
        }

        let mut topics = self.topics.write();
        if topics.contains_key(&id) {
            return Err(RegistryError::Conflict(id));
        }

        let topic = Topic::new(id.clone(), label.to_string(), query.to_string(), resolution);
        topics.insert(id.clone(), topic.clone());
        info!(%id, label, query, resolution = %resolution, "added topic");
        Ok(topic)
    }

    pub fn get(&self, id: &str) -> Option<Topic> {
        self.topics.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self.topics.read().values().cloned().collect();
        topics.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        topics
    }

    pub fn active(&self) -> Vec<Topic> {
        self.list()
            .into_iter()
            .filter(|t| t.status == TopicStatus::Active)
            .collect()
    }

    pub fn counts(&self) -> (usize, usize) {
        let topics = self.topics.read();
        let active = topics
            .values()
            .filter(|t| t.status == TopicStatus::Active)
            .count();
        (topics.len(), active)
    }

    /// Remove a topic, returning its final state so the caller can clear
    /// the label-keyed tick and bar stores.
    pub fn remove(&self, id: &str) -> Result<Topic, RegistryError> {
        let removed = self
            .topics
            .write()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        info!(id, "removed topic");
        Ok(removed)
    }

    pub fn pause(&self, id: &str) -> Result<Topic, RegistryError> {
        self.update(id, |topic| {
            topic.status = TopicStatus::Paused;
        })
    }

    /// Resume polling; also the operator path out of the error state.
    pub fn resume(&self, id: &str) -> Result<Topic, RegistryError> {
        self.update(id, |topic| {
            topic.status = TopicStatus::Active;
            topic.last_error = None;
        })
    }

    pub fn set_resolution(&self, id: &str, resolution: Resolution) -> Result<Topic, RegistryError> {
        self.update(id, |topic| {
            topic.resolution = resolution;
        })
    }

    /// Record a successful poll: stats refresh, error cleared, and an
    /// errored topic returns to active. `total_ticks` is the store's
    /// post-insert count for the label.
    pub fn record_poll_success(&self, id: &str, total_ticks: u64) -> Result<Topic, RegistryError> {
        self.update(id, |topic| {
            topic.last_poll = Some(Utc::now());
            topic.poll_count += 1;
            topic.tick_count = total_ticks;
            topic.last_error = None;
            if topic.status == TopicStatus::Error {
                topic.status = TopicStatus::Active;
            }
        })
    }

    /// Record a failed poll: the topic flips to error but stays registered.
    pub fn record_poll_error(&self, id: &str, error: &str) -> Result<Topic, RegistryError> {
        self.update(id, |topic| {
            topic.status = TopicStatus::Error;
            topic.last_error = Some(error.to_string());
        })
    }

    fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Topic),
    ) -> Result<Topic, RegistryError> {
        let mut topics = self.topics.write();
        let topic = topics
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        mutate(topic);
        Ok(topic.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_derives_id_and_rejects_duplicates() {
        let registry = TopicRegistry::new();
        let topic = registry.add("$TSLA", "$TSLA OR Tesla", Resolution::M5).unwrap();
        assert_eq!(topic.id, "tsla");
        assert_eq!(topic.status, TopicStatus::Active);

        // "$tsla" derives the same id.
        let err = registry.add("$tsla", "other", Resolution::M1).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(id) if id == "tsla"));
    }

    #[test]
    fn empty_derived_id_is_invalid() {
        let registry = TopicRegistry::new();
        let err = registry.add("$ ", "q", Resolution::M1).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[test]
    fn pause_resume_transitions() {
        let registry = TopicRegistry::new();
        registry.add("btc", "btc", Resolution::M1).unwrap();

        let paused = registry.pause("btc").unwrap();
        assert_eq!(paused.status, TopicStatus::Paused);
        assert!(registry.active().is_empty());

        let resumed = registry.resume("btc").unwrap();
        assert_eq!(resumed.status, TopicStatus::Active);
    }

    #[test]
    fn resume_clears_error_state() {
        let registry = TopicRegistry::new();
        registry.add("btc", "btc", Resolution::M1).unwrap();
        registry.record_poll_error("btc", "search timed out").unwrap();

        let topic = registry.get("btc").unwrap();
        assert_eq!(topic.status, TopicStatus::Error);
        assert_eq!(topic.last_error.as_deref(), Some("search timed out"));
        assert!(registry.active().is_empty());

        let resumed = registry.resume("btc").unwrap();
        assert_eq!(resumed.status, TopicStatus::Active);
        assert!(resumed.last_error.is_none());
    }

    #[test]
    fn poll_success_refreshes_stats() {
        let registry = TopicRegistry::new();
        registry.add("btc", "btc", Resolution::M1).unwrap();
        registry.record_poll_error("btc", "boom").unwrap();

        let topic = registry.record_poll_success("btc", 42).unwrap();
        assert_eq!(topic.poll_count, 1);
        assert_eq!(topic.tick_count, 42);
        assert!(topic.last_poll.is_some());
        assert!(topic.last_error.is_none());
        assert_eq!(topic.status, TopicStatus::Active);
    }

    #[test]
    fn missing_topics_are_not_found() {
        let registry = TopicRegistry::new();
        assert!(matches!(
            registry.remove("ghost"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.pause("ghost"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.get("ghost").is_none());
    }
}
