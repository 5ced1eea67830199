//! # Kafka Toolkit
//!
//! Operational core of a local Kafka management tool. It reads a broker
//! installation, supervises the broker process, administers topics and
//! consumer groups, and generates producer/consumer traffic, streaming
//! everything it observes to subscribers of one [`EventBus`].
//!
//! ## Components
//!
//! - [`inspector`] - parse `server.properties`, detect ZooKeeper or KRaft mode, extract endpoints
//! - [`supervisor`] - start, probe, stop and watch the broker process
//! - [`admin`] - topic and consumer-group operations, guarded by broker state
//! - [`simulation`] - producer and consumer jobs against a topic
//! - [`events`] - the event model and the bus carrying it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kafka_toolkit::{Cadence, ToolkitSettings, Toolkit, TopicSpec};
//!
//! #[tokio::main]
//! async fn main() -> kafka_toolkit::Result<()> {
//!     let toolkit = Toolkit::open("/opt/kafka", ToolkitSettings::from_env()?)?;
//!     let mut events = toolkit.bus().subscribe();
//!
//!     toolkit.start_broker().await?;
//!     toolkit.admin().create_topic(&TopicSpec::new("orders", 3, 1)).await?;
//!     toolkit
//!         .simulation()
//!         .start_producer("orders", Cadence::Every(std::time::Duration::from_millis(500)))?;
//!
//!     while let Some(delivery) = events.recv().await {
//!         println!("{:?}", delivery);
//!     }
//!     toolkit.shutdown().await
//! }
//! ```

pub mod admin;
pub mod config;
pub mod events;
pub mod inspector;
pub mod simulation;
pub mod supervisor;
pub mod toolkit;

pub use admin::{AdminClient, AdminError, ClusterInfo, ConsumerGroupSpec, TopicDescription};
pub use config::ToolkitSettings;
pub use events::{
    Delivery, Direction, Envelope, Event, EventBus, LogLevel, Outcome, Subscription,
};
pub use inspector::{BrokerConfig, ClusterMode, ConfigError, ConfigInspector, Endpoint};
pub use kafka_toolkit_client::TopicSpec;
pub use simulation::{
    Cadence, JobId, JobRole, JobSnapshot, JobStatus, SimulationEngine, SimulationError,
};
pub use supervisor::{
    BrokerState, ProcessInfo, ProcessSupervisor, ReadinessProbe, StateWatch, SupervisorError,
    TcpProbe,
};
pub use toolkit::Toolkit;

use thiserror::Error;

/// Toolkit error types
///
/// Each component has its own error enum; this one wraps them so callers
/// driving several components can use a single `?`.
#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Admin error: {0}")]
    Admin(#[from] AdminError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Client error: {0}")]
    Client(#[from] kafka_toolkit_client::ClientError),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for toolkit operations
pub type Result<T> = std::result::Result<T, ToolkitError>;
