//! Record and metadata types shared by every broker connector

use bytes::Bytes;
use serde::Serialize;

use crate::error::ClientError;

pub type TopicName = String;
pub type PartitionId = i32;
pub type Offset = i64;

/// Record handed to a [`crate::RecordSender`]
#[derive(Debug, Clone)]
pub struct ProduceRecord {
    pub topic: TopicName,
    pub partition: Option<PartitionId>, // None for broker-side assignment
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProduceRecord {
    /// Create a new record builder
    pub fn builder() -> ProduceRecordBuilder {
        ProduceRecordBuilder::new()
    }

    /// Create a simple record with topic and value
    pub fn new<T: Into<TopicName>, V: Into<Bytes>>(topic: T, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
        }
    }

    /// Create a record with topic, key, and value
    pub fn with_key<T: Into<TopicName>, K: Into<Bytes>, V: Into<Bytes>>(
        topic: T,
        key: K,
        value: V,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: Some(key.into()),
            value: value.into(),
        }
    }
}

/// Builder for ProduceRecord
#[derive(Debug, Default)]
pub struct ProduceRecordBuilder {
    topic: Option<TopicName>,
    partition: Option<PartitionId>,
    key: Option<Bytes>,
    value: Option<Bytes>,
}

impl ProduceRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic<T: Into<TopicName>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn value<V: Into<Bytes>>(mut self, value: V) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn build(self) -> Result<ProduceRecord, ClientError> {
        let topic = self
            .topic
            .ok_or_else(|| ClientError::producer("record has no topic"))?;

        Ok(ProduceRecord {
            topic,
            partition: self.partition,
            key: self.key,
            value: self.value.unwrap_or_default(),
        })
    }
}

/// Record delivered by a [`crate::RecordReceiver`]
#[derive(Debug, Clone)]
pub struct ConsumeRecord {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Broker timestamp in milliseconds since the epoch, when the broker supplied one
    pub timestamp: Option<i64>,
}

/// Where the broker stored a produced record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceMetadata {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
}

/// Topic creation request: name, partition count and replication factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSpec {
    pub name: TopicName,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new<S: Into<TopicName>>(name: S, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerMetadata {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionMetadata {
    pub id: PartitionId,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicMetadata {
    pub name: TopicName,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    /// Internal topics (`__consumer_offsets`, `__transaction_state`, ...) start with a double underscore
    pub fn is_internal(&self) -> bool {
        self.name.starts_with("__")
    }
}

/// Cluster-wide metadata snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

/// A consumer group as reported by the group coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupListing {
    pub group_id: String,
    pub state: String,
    pub protocol_type: String,
    pub member_count: usize,
}
