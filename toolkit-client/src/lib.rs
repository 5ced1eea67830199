//! # kafka-toolkit client layer
//!
//! Broker-facing sessions used by the kafka-toolkit core, expressed as small
//! capability traits so the core never depends on a concrete client:
//!
//! - [`ClusterAdmin`]: topic and consumer-group administration
//! - [`RecordSender`]: produce a record and learn its partition/offset
//! - [`RecordReceiver`]: a subscribed group member
//! - [`BrokerConnector`]: factory for the three above
//!
//! Two implementations ship with the crate. [`KafkaClient`] talks to a real
//! cluster through librdkafka; [`InMemoryCluster`] keeps everything in the
//! current process and is what the toolkit's own tests run against.
//!
//! ```rust,no_run
//! use kafka_toolkit_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = KafkaClient::with_brokers(vec!["localhost:9092"]);
//!
//!     let admin = client.admin()?;
//!     admin.create_topic(&TopicSpec::new("my-topic", 3, 1)).await?;
//!
//!     let producer = client.producer()?;
//!     let metadata = producer
//!         .send(ProduceRecord::with_key("my-topic", "user-123", "Hello Kafka!"))
//!         .await?;
//!     println!("Message sent to partition {} at offset {}",
//!              metadata.partition, metadata.offset);
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod record;

pub use admin::*;
pub use client::*;
pub use config::*;
pub use consumer::*;
pub use error::*;
pub use memory::{InMemoryCluster, InMemoryConsumer};
pub use metrics::{global_metrics, ClientMetrics, MetricsSnapshot};
pub use producer::*;
pub use record::*;

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
