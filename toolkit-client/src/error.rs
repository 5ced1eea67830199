//! Error types for the kafka-toolkit client layer

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

/// Main error type for broker client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Broker unreachable, transport failure or coordinator/leader unavailable
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Request or operation timed out
    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Topic '{topic}' already exists")]
    TopicAlreadyExists { topic: String },

    #[error("Topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    #[error("Consumer group '{group}' does not exist")]
    GroupNotFound { group: String },

    #[error("Consumer group '{group}' still has active members")]
    GroupNotEmpty { group: String },

    /// Any other refusal reported by the broker
    #[error("Broker error {code}: {message}")]
    Broker { code: String, message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Producer-specific errors
    #[error("Producer error: {message}")]
    Producer { message: String },

    /// Consumer-specific errors
    #[error("Consumer error: {message}")]
    Consumer { message: String },
}

impl ClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new producer error
    pub fn producer<S: Into<String>>(message: S) -> Self {
        Self::Producer {
            message: message.into(),
        }
    }

    /// Create a new consumer error
    pub fn consumer<S: Into<String>>(message: S) -> Self {
        Self::Consumer {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Network-level failures worth one more attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Classify a librdkafka error code. `target` names the topic or group the
    /// request was about.
    pub fn from_code(code: RDKafkaErrorCode, target: &str) -> Self {
        use RDKafkaErrorCode::*;

        match code {
            TopicAlreadyExists => Self::TopicAlreadyExists {
                topic: target.to_string(),
            },
            UnknownTopicOrPartition | UnknownTopic => Self::TopicNotFound {
                topic: target.to_string(),
            },
            GroupIdNotFound => Self::GroupNotFound {
                group: target.to_string(),
            },
            NonEmptyGroup => Self::GroupNotEmpty {
                group: target.to_string(),
            },
            OperationTimedOut | RequestTimedOut | MessageTimedOut => {
                Self::timeout(format!("{}: {}", target, code))
            }
            BrokerTransportFailure
            | AllBrokersDown
            | NetworkException
            | BrokerNotAvailable
            | LeaderNotAvailable
            | NotLeaderForPartition
            | CoordinatorNotAvailable
            | CoordinatorLoadInProgress
            | NotCoordinator
            | Resolve => Self::connection(format!("{}: {}", target, code)),
            other => Self::Broker {
                code: format!("{:?}", other),
                message: format!("{}: {}", target, other),
            },
        }
    }

    /// Classify an rdkafka error, falling back to the error text when it
    /// carries no librdkafka code (client creation, subscription, ...).
    pub fn from_kafka(err: KafkaError, target: &str) -> Self {
        match err.rdkafka_error_code() {
            Some(code) => Self::from_code(code, target),
            None => match err {
                KafkaError::ClientConfig(_, _, _, _) | KafkaError::ClientCreation(_) => {
                    Self::invalid_config(err.to_string())
                }
                KafkaError::Subscription(_) => Self::consumer(err.to_string()),
                KafkaError::Canceled => Self::connection(format!("{}: request canceled", target)),
                other => Self::Broker {
                    code: "Unknown".to_string(),
                    message: format!("{}: {}", target, other),
                },
            },
        }
    }
}
