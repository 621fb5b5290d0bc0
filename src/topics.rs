// src/topics.rs

use dashmap::DashMap;

use crate::broker::{Broker, PublishError};

/// Explicit channel registry, constructed once at process start and passed to
/// the components that need it. Stages register the channels they consume or
/// produce; before any worker starts, the registry is checked against the
/// broker so every registered channel exists with its partition count.
pub struct TopicRegistry {
    default_partitions: u32,
    topics: DashMap<String, u32>,
}

impl TopicRegistry {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
            topics: DashMap::new(),
        }
    }

    /// Register a channel with the default partition count. Re-registration
    /// keeps the first entry.
    pub fn register(&self, channel: &str) {
        self.register_with(channel, self.default_partitions);
    }

    pub fn register_with(&self, channel: &str, partitions: u32) {
        self.topics
            .entry(channel.to_string())
            .or_insert(partitions.max(1));
    }

    pub fn partitions(&self, channel: &str) -> Option<u32> {
        self.topics.get(channel).map(|p| *p)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Make sure every registered channel exists on the broker.
    pub async fn ensure_all(&self, broker: &dyn Broker) -> Result<(), PublishError> {
        for entry in self.topics.iter() {
            broker.ensure_channel(entry.key(), *entry.value()).await?;
        }
        Ok(())
    }
}
