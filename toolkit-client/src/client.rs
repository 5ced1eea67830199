//! High-level client interface

use std::sync::Arc;
use std::time::Duration;

use crate::admin::{ClusterAdmin, KafkaAdmin};
use crate::config::{Acks, ClientConfig, OffsetReset};
use crate::consumer::{ConsumerBuilder, RecordReceiver};
use crate::producer::{ProducerBuilder, RecordSender};
use crate::Result;

/// Factory for the three kinds of broker session the toolkit needs.
///
/// Implementations must be cheap to call repeatedly; callers create a fresh
/// consumer per simulation job and share admin and producer handles.
pub trait BrokerConnector: Send + Sync {
    fn admin(&self) -> Result<Arc<dyn ClusterAdmin>>;

    fn producer(&self) -> Result<Arc<dyn RecordSender>>;

    /// A consumer subscribed to `topic` as a member of `group_id`
    fn consumer(&self, group_id: &str, topic: &str) -> Result<Box<dyn RecordReceiver>>;

    /// `bootstrap.servers` this connector talks to
    fn bootstrap_servers(&self) -> String;
}

/// Main client for Kafka operations
#[derive(Debug, Clone)]
pub struct KafkaClient {
    config: ClientConfig,
    delivery_timeout: Duration,
}

impl KafkaClient {
    /// Create a new Kafka client
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            delivery_timeout: Duration::from_secs(30),
        }
    }

    /// Create a client with custom brokers
    pub fn with_brokers<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = ClientConfig {
            brokers: brokers.into_iter().map(|s| s.into()).collect(),
            ..ClientConfig::default()
        };
        Self::new(config)
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl BrokerConnector for KafkaClient {
    fn admin(&self) -> Result<Arc<dyn ClusterAdmin>> {
        Ok(Arc::new(KafkaAdmin::new(self.config.clone())?))
    }

    fn producer(&self) -> Result<Arc<dyn RecordSender>> {
        let producer = ProducerBuilder::new()
            .client_config(self.config.clone())
            .acks(Acks::All)
            .delivery_timeout(self.delivery_timeout)
            .build()?;
        Ok(Arc::new(producer))
    }

    fn consumer(&self, group_id: &str, topic: &str) -> Result<Box<dyn RecordReceiver>> {
        let consumer = ConsumerBuilder::new()
            .client_config(self.config.clone())
            .group_id(group_id)
            .topics(vec![topic])
            .offset_reset(OffsetReset::Latest)
            .build()?;
        Ok(Box::new(consumer))
    }

    fn bootstrap_servers(&self) -> String {
        self.config.bootstrap_servers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_brokers() {
        let client = KafkaClient::with_brokers(vec!["a:9092", "b:9092"]);
        assert_eq!(client.bootstrap_servers(), "a:9092,b:9092");
    }

    #[tokio::test]
    async fn test_sessions_are_created_lazily() {
        // librdkafka connects on first use, so no broker is needed here.
        let client = KafkaClient::with_brokers(vec!["localhost:19092"])
            .with_delivery_timeout(Duration::from_secs(1));
        assert!(client.producer().is_ok());
        assert!(client.consumer("toolkit-test", "orders").is_ok());
    }

    #[test]
    fn test_sessions_reject_empty_brokers() {
        let client = KafkaClient::with_brokers(Vec::<String>::new());
        assert!(client.producer().is_err());
        assert!(client.consumer("toolkit-test", "orders").is_err());
    }
}
