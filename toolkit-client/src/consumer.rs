//! Consumer client for receiving records

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ClientConfig, ConsumerConfig, ConsumerConfigBuilder, OffsetReset};
use crate::error::ClientError;
use crate::metrics::global_metrics;
use crate::record::ConsumeRecord;
use crate::Result;

/// A subscribed consumer session
#[async_trait]
pub trait RecordReceiver: Send {
    /// Next record, or `None` when nothing arrived within `timeout`
    async fn recv(&mut self, timeout: Duration) -> Result<Option<ConsumeRecord>>;
}

/// [`RecordReceiver`] backed by an rdkafka `StreamConsumer`. Offsets are
/// committed automatically; dropping it leaves the group.
pub struct KafkaConsumer {
    config: ConsumerConfig,
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// Create a consumer and subscribe it to the configured topics
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;

        let consumer: StreamConsumer = config
            .to_rdkafka()
            .create()
            .map_err(|e| ClientError::from_kafka(e, "consumer"))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ClientError::from_kafka(e, &config.topics.join(",")))?;

        info!(
            "Consumer subscribed to {:?} as group '{}'",
            config.topics,
            config.group_id.as_deref().unwrap_or_default()
        );
        Ok(Self { config, consumer })
    }

    pub fn group_id(&self) -> Option<&str> {
        self.config.group_id.as_deref()
    }
}

#[async_trait]
impl RecordReceiver for KafkaConsumer {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<ConsumeRecord>> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(KafkaError::PartitionEOF(partition))) => {
                debug!("Reached end of partition {}", partition);
                return Ok(None);
            }
            Ok(Err(e)) => {
                global_metrics().record_consume_error();
                return Err(ClientError::from_kafka(e, &self.config.topics.join(",")));
            }
            Ok(Ok(message)) => message,
        };

        let value = message.payload().map(Bytes::copy_from_slice).unwrap_or_default();
        global_metrics().record_consume(value.len() as u64);

        Ok(Some(ConsumeRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            value,
            timestamp: message.timestamp().to_millis(),
        }))
    }
}

/// Builder for KafkaConsumer
#[derive(Default)]
pub struct ConsumerBuilder {
    config: ConsumerConfigBuilder,
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config = self.config.client_config(client_config);
        self
    }

    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config = self.config.group_id(group_id);
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.topics(topics);
        self
    }

    /// Where a group with no committed offset starts reading
    pub fn offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.config = self.config.offset_reset(offset_reset);
        self
    }

    pub fn build(self) -> Result<KafkaConsumer> {
        KafkaConsumer::new(self.config.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_requires_topics() {
        let result = ConsumerBuilder::new().group_id("g").build();
        assert!(matches!(result, Err(ClientError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_consumer_subscribes_without_broker() {
        let consumer = ConsumerBuilder::new()
            .group_id("toolkit-test")
            .topics(vec!["orders"])
            .build()
            .unwrap();
        assert_eq!(consumer.group_id(), Some("toolkit-test"));
    }
}
