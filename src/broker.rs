// src/broker.rs

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Durability acknowledgment for one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub channel: String,
    pub partition: u32,
    pub offset: u64,
}

/// One delivered message from a subscription.
#[derive(Debug, Clone)]
pub struct Record {
    pub channel: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("channel `{0}` is not registered with the broker")]
    UnknownChannel(String),
    #[error("broker rejected the write to `{channel}`: {reason}")]
    Rejected { channel: String, reason: String },
}

/// Named, partitioned publish/subscribe channels. `publish` blocks until the
/// broker acknowledges the write; subscriptions deliver (key, value) records
/// per partition at least once, in arrival order within a partition.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ensure_channel(&self, channel: &str, partitions: u32) -> Result<(), PublishError>;

    async fn publish(
        &self,
        channel: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<Ack, PublishError>;

    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, PublishError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next record, or None once the channel is gone.
    async fn next(&mut self) -> Option<Record>;
}

struct PartitionState {
    next_offset: u64,
    senders: Vec<mpsc::UnboundedSender<Record>>,
}

struct Topic {
    partitions: Vec<Mutex<PartitionState>>,
}

impl Topic {
    fn with_partitions(count: u32) -> Self {
        let partitions = (0..count.max(1))
            .map(|_| {
                Mutex::new(PartitionState {
                    next_offset: 0,
                    senders: Vec::new(),
                })
            })
            .collect();
        Self { partitions }
    }
}

/// In-process stand-in for the cluster broker, used by local runs and tests.
/// Each subscription behaves like a single-member consumer group owning every
/// partition of the channel; records published after the subscription attach
/// are delivered once each, partition order preserved.
pub struct InMemoryBroker {
    topics: DashMap<String, Arc<Topic>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
        })
    }

    fn partition_for(key: Option<&str>, partitions: usize) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as usize
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_channel(&self, channel: &str, partitions: u32) -> Result<(), PublishError> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Topic::with_partitions(partitions)));
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> Result<Ack, PublishError> {
        let topic = self
            .topics
            .get(channel)
            .map(|t| t.clone())
            .ok_or_else(|| PublishError::UnknownChannel(channel.to_string()))?;

        let partition = Self::partition_for(key, topic.partitions.len());
        let mut state = topic.partitions[partition]
            .lock()
            .expect("partition lock poisoned");
        let offset = state.next_offset;
        state.next_offset += 1;

        let record = Record {
            channel: channel.to_string(),
            partition: partition as u32,
            offset,
            key: key.map(str::to_string),
            value: value.to_vec(),
        };
        state.senders.retain(|s| s.send(record.clone()).is_ok());

        Ok(Ack {
            channel: channel.to_string(),
            partition: partition as u32,
            offset,
        })
    }

    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, PublishError> {
        let topic = self
            .topics
            .get(channel)
            .map(|t| t.clone())
            .ok_or_else(|| PublishError::UnknownChannel(channel.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for partition in &topic.partitions {
            partition
                .lock()
                .expect("partition lock poisoned")
                .senders
                .push(tx.clone());
        }
        debug!(channel, group, "subscription attached");
        Ok(Box::new(InMemorySubscription { rx }))
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<Record>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Record> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_to_unknown_channel_fails() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("nope", None, b"x").await.unwrap_err();
        assert!(matches!(err, PublishError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn acks_carry_increasing_offsets() {
        let broker = InMemoryBroker::new();
        broker.ensure_channel("tracks", 1).await.unwrap();
        let a = broker.publish("tracks", Some("t1"), b"a").await.unwrap();
        let b = broker.publish("tracks", Some("t1"), b"b").await.unwrap();
        assert_eq!(a.channel, "tracks");
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn subscription_sees_records_in_partition_order() {
        let broker = InMemoryBroker::new();
        broker.ensure_channel("tracks", 1).await.unwrap();
        let mut sub = broker.subscribe("tracks", "worker-0").await.unwrap();

        for i in 0..3u8 {
            broker.publish("tracks", Some("t1"), &[i]).await.unwrap();
        }
        for i in 0..3u8 {
            let record = sub.next().await.unwrap();
            assert_eq!(record.value, vec![i]);
            assert_eq!(record.offset, i as u64);
            assert_eq!(record.key.as_deref(), Some("t1"));
        }
    }

    #[tokio::test]
    async fn same_key_lands_on_one_partition() {
        let broker = InMemoryBroker::new();
        broker.ensure_channel("tracks", 4).await.unwrap();
        let first = broker.publish("tracks", Some("task-9"), b"a").await.unwrap();
        for _ in 0..5 {
            let ack = broker.publish("tracks", Some("task-9"), b"b").await.unwrap();
            assert_eq!(ack.partition, first.partition);
        }
    }

    #[tokio::test]
    async fn each_subscription_gets_its_own_copy() {
        let broker = InMemoryBroker::new();
        broker.ensure_channel("tracks", 2).await.unwrap();
        let mut one = broker.subscribe("tracks", "a").await.unwrap();
        let mut two = broker.subscribe("tracks", "b").await.unwrap();
        broker.publish("tracks", Some("k"), b"hello").await.unwrap();
        assert_eq!(one.next().await.unwrap().value, b"hello");
        assert_eq!(two.next().await.unwrap().value, b"hello");
    }
}
