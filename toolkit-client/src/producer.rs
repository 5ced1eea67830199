//! Producer client for sending records

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::debug;

use crate::config::{Acks, ClientConfig, ProducerConfig, ProducerConfigBuilder};
use crate::error::ClientError;
use crate::metrics::{global_metrics, Timer};
use crate::record::{ProduceMetadata, ProduceRecord};
use crate::Result;

/// Anything that can deliver a record to a topic and report where it landed
#[async_trait]
pub trait RecordSender: Send + Sync {
    async fn send(&self, record: ProduceRecord) -> Result<ProduceMetadata>;
}

/// [`RecordSender`] backed by an rdkafka `FutureProducer`
#[derive(Clone)]
pub struct KafkaProducer {
    config: ProducerConfig,
    producer: FutureProducer,
}

impl KafkaProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: ProducerConfig) -> Result<Self> {
        config.client_config.validate()?;

        let producer = config
            .to_rdkafka()
            .create::<FutureProducer>()
            .map_err(|e| ClientError::from_kafka(e, "producer"))?;

        Ok(Self { config, producer })
    }
}

#[async_trait]
impl RecordSender for KafkaProducer {
    async fn send(&self, record: ProduceRecord) -> Result<ProduceMetadata> {
        let timer = Timer::start();
        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).payload(&record.value[..]);
        if let Some(key) = &record.key {
            future_record = future_record.key(&key[..]);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        let delivery = self
            .producer
            .send(future_record, self.config.delivery_timeout)
            .await;

        match delivery {
            Ok((partition, offset)) => {
                global_metrics().record_send(record.value.len() as u64, timer.elapsed());
                debug!(
                    "Delivered record to {}[{}] at offset {}",
                    record.topic, partition, offset
                );
                Ok(ProduceMetadata {
                    topic: record.topic,
                    partition,
                    offset,
                })
            }
            Err((err, _message)) => {
                global_metrics().record_send_error();
                Err(ClientError::from_kafka(err, &record.topic))
            }
        }
    }
}

/// Builder for KafkaProducer
pub struct ProducerBuilder {
    config: ProducerConfigBuilder,
}

impl ProducerBuilder {
    /// Create a new producer builder
    pub fn new() -> Self {
        Self {
            config: ProducerConfigBuilder::new(),
        }
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config = self.config.client_config(client_config);
        self
    }

    /// Set the acknowledgment level
    pub fn acks(mut self, acks: Acks) -> Self {
        self.config = self.config.acks(acks);
        self
    }

    /// Set the delivery timeout
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.delivery_timeout(timeout);
        self
    }

    /// Build the producer
    pub fn build(self) -> Result<KafkaProducer> {
        KafkaProducer::new(self.config.build())
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
