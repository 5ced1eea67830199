//! Configuration types for broker clients

use std::time::Duration;

use crate::error::ClientError;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// List of broker addresses
    pub brokers: Vec<String>,
    /// Socket connection setup timeout
    pub connection_timeout: Duration,
    /// Admin and metadata request timeout
    pub request_timeout: Duration,
    /// Client identifier
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            client_id: None,
        }
    }
}

impl ClientConfig {
    /// Comma-separated `bootstrap.servers` value
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.brokers.is_empty() {
            return Err(ClientError::invalid_config("at least one broker is required"));
        }
        if self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ClientError::invalid_config("broker address cannot be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(ClientError::invalid_config("request timeout must be positive"));
        }
        Ok(())
    }

    /// Base librdkafka configuration shared by admin, producer and consumer handles
    pub fn to_rdkafka(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set(
                "socket.connection.setup.timeout.ms",
                self.connection_timeout.as_millis().to_string(),
            );
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }
        config
    }
}

/// Acknowledgment level required from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    None,
    Leader,
    All,
}

impl Acks {
    fn as_str(self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    pub acks: Acks,
    /// Upper bound for a single send, including queueing
    pub delivery_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            acks: Acks::All,
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

impl ProducerConfig {
    pub fn to_rdkafka(&self) -> rdkafka::ClientConfig {
        let mut config = self.client_config.to_rdkafka();
        config
            .set("acks", self.acks.as_str())
            .set(
                "message.timeout.ms",
                self.delivery_timeout.as_millis().to_string(),
            );
        config
    }
}

/// Where a consumer starts when its group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    fn as_str(self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Auto-commit configuration
#[derive(Debug, Clone)]
pub struct AutoCommitConfig {
    /// Enable automatic offset commits
    pub enable: bool,
    /// Auto-commit interval
    pub interval: Duration,
}

impl Default for AutoCommitConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval: Duration::from_secs(5),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    /// Consumer group ID
    pub group_id: Option<String>,
    /// Topics to subscribe to
    pub topics: Vec<String>,
    pub offset_reset: OffsetReset,
    pub auto_commit: AutoCommitConfig,
    /// Session timeout for consumer groups
    pub session_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            group_id: None,
            topics: Vec::new(),
            offset_reset: OffsetReset::Latest,
            auto_commit: AutoCommitConfig::default(),
            session_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        self.client_config.validate()?;
        match &self.group_id {
            Some(group) if !group.trim().is_empty() => {}
            _ => return Err(ClientError::invalid_config("consumer group id is required")),
        }
        if self.topics.is_empty() {
            return Err(ClientError::invalid_config(
                "At least one topic must be specified",
            ));
        }
        Ok(())
    }

    pub fn to_rdkafka(&self) -> rdkafka::ClientConfig {
        let mut config = self.client_config.to_rdkafka();
        if let Some(group_id) = &self.group_id {
            config.set("group.id", group_id);
        }
        config
            .set("auto.offset.reset", self.offset_reset.as_str())
            .set("enable.auto.commit", self.auto_commit.enable.to_string())
            .set(
                "auto.commit.interval.ms",
                self.auto_commit.interval.as_millis().to_string(),
            )
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            );
        config
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn acks(mut self, acks: Acks) -> Self {
        self.config.acks = acks;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery_timeout = timeout;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config.group_id = Some(group_id.into());
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.config.offset_reset = offset_reset;
        self
    }

    pub fn auto_commit(mut self, auto_commit: AutoCommitConfig) -> Self {
        self.config.auto_commit = auto_commit;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .brokers(vec!["broker1:9092", "broker2:9092"])
            .connection_timeout(Duration::from_secs(3))
            .client_id("test-client")
            .build();

        assert_eq!(config.brokers, vec!["broker1:9092", "broker2:9092"]);
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert_eq!(config.client_id, Some("test-client".to_string()));
        assert_eq!(config.bootstrap_servers(), "broker1:9092,broker2:9092");
    }

    #[test]
    fn test_client_config_rdkafka_properties() {
        let config = ClientConfigBuilder::new()
            .brokers(vec!["localhost:9093"])
            .client_id("toolkit")
            .build()
            .to_rdkafka();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9093"));
        assert_eq!(config.get("client.id"), Some("toolkit"));
    }

    #[test]
    fn test_producer_config_defaults_to_all_acks() {
        let config = ProducerConfigBuilder::new()
            .delivery_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.acks, Acks::All);
        let rd = config.to_rdkafka();
        assert_eq!(rd.get("acks"), Some("all"));
        assert_eq!(rd.get("message.timeout.ms"), Some("5000"));
    }

    #[test]
    fn test_consumer_config_builder() {
        let config = ConsumerConfigBuilder::new()
            .group_id("test-group")
            .topics(vec!["topic1", "topic2"])
            .build();

        assert_eq!(config.group_id, Some("test-group".to_string()));
        assert_eq!(config.topics, vec!["topic1", "topic2"]);
        assert_eq!(config.offset_reset, OffsetReset::Latest);
        assert!(config.validate().is_ok());

        let rd = config.to_rdkafka();
        assert_eq!(rd.get("group.id"), Some("test-group"));
        assert_eq!(rd.get("auto.offset.reset"), Some("latest"));
        assert_eq!(rd.get("enable.auto.commit"), Some("true"));
    }

    #[test]
    fn test_consumer_config_requires_group_and_topic() {
        let no_group = ConsumerConfigBuilder::new().topics(vec!["t"]).build();
        assert!(matches!(
            no_group.validate(),
            Err(ClientError::InvalidConfig { .. })
        ));

        let no_topics = ConsumerConfigBuilder::new().group_id("g").build();
        assert!(no_topics.validate().is_err());
    }
}
