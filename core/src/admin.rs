//! Topic and consumer-group administration.
//!
//! [`AdminClient`] refuses every call unless the supervised broker is
//! `Running`, gives transient network failures exactly one retry and reports
//! every outcome on the [`EventBus`] as an [`AdminResultEvent`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kafka_toolkit_client::{
    global_metrics, ClientError, ClusterAdmin, MetricsSnapshot, PartitionMetadata, TopicSpec,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ToolkitSettings;
use crate::events::{AdminResultEvent, Event, EventBus, Outcome};
use crate::inspector::{BrokerConfig, ClusterMode};
use crate::supervisor::{BrokerState, StateWatch};

/// Longest topic name the broker accepts
pub const MAX_TOPIC_NAME_LEN: usize = 249;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Broker is not running (state: {state})")]
    NotRunning { state: BrokerState },

    #[error("'{target}' already exists")]
    AlreadyExists { target: String },

    #[error("'{target}' does not exist")]
    NotFound { target: String },

    #[error("{operation} failed after retry: {source}")]
    RetriesExhausted {
        operation: String,
        #[source]
        source: ClientError,
    },

    #[error("Invalid request: {reason}")]
    InvalidSpec { reason: String },

    #[error("{operation} rejected by broker: {source}")]
    Broker {
        operation: String,
        #[source]
        source: ClientError,
    },
}

impl AdminError {
    fn invalid<S: Into<String>>(reason: S) -> Self {
        AdminError::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Map a non-retried client failure onto the admin taxonomy
    fn from_client(operation: &str, error: ClientError) -> Self {
        match error {
            ClientError::TopicAlreadyExists { topic } => AdminError::AlreadyExists { target: topic },
            ClientError::TopicNotFound { topic } => AdminError::NotFound { target: topic },
            ClientError::GroupNotFound { group } => AdminError::NotFound { target: group },
            source => AdminError::Broker {
                operation: operation.to_string(),
                source,
            },
        }
    }
}

/// A consumer group with its observed membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerGroupSpec {
    pub group_id: String,
    pub member_count: usize,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicDescription {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicDescription {
    pub fn replication_factor(&self) -> usize {
        self.partitions
            .first()
            .map(|p| p.replicas.len())
            .unwrap_or(0)
    }
}

/// One-screen summary of the cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub bootstrap_servers: String,
    pub mode: Option<ClusterMode>,
    pub state: BrokerState,
    pub broker_count: usize,
    pub topic_count: usize,
    pub group_count: usize,
    /// Process-wide counters of every client session the toolkit opened
    pub client_metrics: MetricsSnapshot,
}

/// Reject names the broker would refuse anyway: empty, `.`/`..`, longer than
/// 249 characters or containing anything outside `[a-zA-Z0-9._-]`.
pub fn validate_topic_name(name: &str) -> Result<(), AdminError> {
    if name.is_empty() {
        return Err(AdminError::invalid("topic name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(AdminError::invalid(format!("topic name '{}' is reserved", name)));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(AdminError::invalid(format!(
            "topic name is {} characters, the limit is {}",
            name.len(),
            MAX_TOPIC_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(AdminError::invalid(format!(
            "topic name '{}' contains illegal character '{}'",
            name, c
        )));
    }
    Ok(())
}

fn validate_topic_spec(spec: &TopicSpec) -> Result<(), AdminError> {
    validate_topic_name(&spec.name)?;
    if spec.partitions < 1 {
        return Err(AdminError::invalid("partition count must be at least 1"));
    }
    if spec.replication_factor < 1 {
        return Err(AdminError::invalid("replication factor must be at least 1"));
    }
    Ok(())
}

fn validate_group_id(group_id: &str) -> Result<(), AdminError> {
    if group_id.trim().is_empty() {
        return Err(AdminError::invalid("group id must not be empty"));
    }
    Ok(())
}

/// Session wrapper around a [`ClusterAdmin`]
pub struct AdminClient {
    admin: Arc<dyn ClusterAdmin>,
    state: StateWatch,
    bus: EventBus,
    request_timeout: Duration,
    retry_pause: Duration,
    group_park: Duration,
    bootstrap_servers: String,
    mode: Option<ClusterMode>,
}

impl AdminClient {
    pub fn new(
        admin: Arc<dyn ClusterAdmin>,
        state: StateWatch,
        bus: EventBus,
        settings: &ToolkitSettings,
    ) -> Self {
        Self {
            admin,
            state,
            bus,
            request_timeout: settings.admin_request_timeout(),
            retry_pause: settings.admin_retry_pause(),
            group_park: settings.group_park(),
            bootstrap_servers: String::new(),
            mode: None,
        }
    }

    /// Remember which installation this client talks to, for [`Self::cluster_info`]
    pub fn with_broker_config(mut self, config: &BrokerConfig) -> Self {
        self.bootstrap_servers = config.bootstrap_servers();
        self.mode = Some(config.mode);
        self
    }

    /// Topic names, internal (`__`-prefixed) topics excluded
    pub async fn list_topics(&self) -> Result<Vec<String>, AdminError> {
        let result = self
            .run("list_topics", || self.admin.metadata(), self.request_timeout)
            .await
            .map(|metadata| {
                let mut names: Vec<String> = metadata
                    .topics
                    .into_iter()
                    .filter(|t| !t.is_internal())
                    .map(|t| t.name)
                    .collect();
                names.sort();
                names
            });
        self.report("list_topics", "*", &result);
        result
    }

    pub async fn describe_topic(&self, name: &str) -> Result<TopicDescription, AdminError> {
        let result = self
            .run("describe_topic", || self.admin.metadata(), self.request_timeout)
            .await
            .and_then(|metadata| {
                metadata
                    .topics
                    .into_iter()
                    .find(|t| t.name == name)
                    .map(|t| TopicDescription {
                        name: t.name,
                        partitions: t.partitions,
                    })
                    .ok_or_else(|| AdminError::NotFound {
                        target: name.to_string(),
                    })
            });
        self.report("describe_topic", name, &result);
        result
    }

    pub async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError> {
        let result = match self.ensure_running().and_then(|()| validate_topic_spec(spec)) {
            Ok(()) => {
                self.run(
                    "create_topic",
                    || self.admin.create_topic(spec),
                    self.request_timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if result.is_ok() {
            info!(
                "Created topic '{}' ({} partitions, replication {})",
                spec.name, spec.partitions, spec.replication_factor
            );
        }
        self.report("create_topic", &spec.name, &result);
        result
    }

    pub async fn delete_topic(&self, name: &str) -> Result<(), AdminError> {
        let result = self
            .run("delete_topic", || self.admin.delete_topic(name), self.request_timeout)
            .await;
        if result.is_ok() {
            info!("Deleted topic '{}'", name);
        }
        self.report("delete_topic", name, &result);
        result
    }

    pub async fn list_groups(&self) -> Result<Vec<ConsumerGroupSpec>, AdminError> {
        let result = self
            .run("list_groups", || self.admin.list_groups(), self.request_timeout)
            .await
            .map(|groups| {
                groups
                    .into_iter()
                    .map(|g| ConsumerGroupSpec {
                        group_id: g.group_id,
                        member_count: g.member_count,
                        state: g.state,
                    })
                    .collect()
            });
        self.report("list_groups", "*", &result);
        result
    }

    /// Register `group_id` with the coordinator by parking a throwaway
    /// consumer in it. The broker needs at least one topic to subscribe to.
    pub async fn create_group(&self, group_id: &str) -> Result<(), AdminError> {
        let result = match self.ensure_running().and_then(|()| validate_group_id(group_id)) {
            Ok(()) => {
                self.run(
                    "create_group",
                    || self.admin.register_group(group_id, self.group_park),
                    self.group_park + self.request_timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if result.is_ok() {
            info!("Registered consumer group '{}'", group_id);
        }
        self.report("create_group", group_id, &result);
        result
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<(), AdminError> {
        let result = self
            .run(
                "delete_group",
                || self.admin.delete_group(group_id),
                self.request_timeout,
            )
            .await;
        if result.is_ok() {
            info!("Deleted consumer group '{}'", group_id);
        }
        self.report("delete_group", group_id, &result);
        result
    }

    pub async fn cluster_info(&self) -> Result<ClusterInfo, AdminError> {
        let result = async {
            let metadata = self
                .run("cluster_info", || self.admin.metadata(), self.request_timeout)
                .await?;
            let groups = self
                .run("cluster_info", || self.admin.list_groups(), self.request_timeout)
                .await?;

            Ok::<_, AdminError>(ClusterInfo {
                bootstrap_servers: self.bootstrap_servers.clone(),
                mode: self.mode,
                state: self.state.current(),
                broker_count: metadata.brokers.len(),
                topic_count: metadata.topics.iter().filter(|t| !t.is_internal()).count(),
                group_count: groups.len(),
                client_metrics: global_metrics().snapshot(),
            })
        }
        .await;
        self.report("cluster_info", &self.bootstrap_servers, &result);
        result
    }

    fn ensure_running(&self) -> Result<(), AdminError> {
        let state = self.state.current();
        if state.is_running() {
            Ok(())
        } else {
            Err(AdminError::NotRunning { state })
        }
    }

    /// One bounded attempt, plus a single retry after `retry_pause` when the
    /// first failure is transient.
    async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut request: F,
        timeout: Duration,
    ) -> Result<T, AdminError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = kafka_toolkit_client::Result<T>>,
    {
        self.ensure_running()?;

        let error = match attempt(request(), timeout).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(AdminError::from_client(operation, e)),
        };

        warn!(
            "{} failed ({}), retrying in {:?}",
            operation, error, self.retry_pause
        );
        tokio::time::sleep(self.retry_pause).await;
        self.ensure_running()?;

        match attempt(request(), timeout).await {
            Ok(value) => {
                debug!("{} succeeded on retry", operation);
                Ok(value)
            }
            Err(source) if source.is_transient() => Err(AdminError::RetriesExhausted {
                operation: operation.to_string(),
                source,
            }),
            Err(e) => Err(AdminError::from_client(operation, e)),
        }
    }

    fn report<T>(&self, operation: &str, target: &str, result: &Result<T, AdminError>) {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(e) => {
                warn!("{} '{}' failed: {}", operation, target, e);
                Outcome::failure(e)
            }
        };
        self.bus.publish(Event::AdminResult(AdminResultEvent {
            operation: operation.to_string(),
            target: target.to_string(),
            outcome,
            timestamp: Utc::now(),
        }));
    }
}

async fn attempt<T, Fut>(request: Fut, timeout: Duration) -> kafka_toolkit_client::Result<T>
where
    Fut: Future<Output = kafka_toolkit_client::Result<T>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::timeout(format!(
            "no response within {:?}",
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Delivery;
    use crate::supervisor::StateCell;
    use async_trait::async_trait;
    use bytes::Bytes;
    use kafka_toolkit_client::{
        BrokerConnector, ClusterMetadata, GroupListing, InMemoryCluster, ProduceRecord,
        RecordSender,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> ToolkitSettings {
        ToolkitSettings {
            admin_retry_pause_ms: 10,
            admin_request_timeout_ms: 1_000,
            group_park_ms: 100,
            ..ToolkitSettings::default()
        }
    }

    fn running_state(bus: &EventBus) -> StateCell {
        let cell = StateCell::new(bus.clone());
        cell.transition(|_| true, BrokerState::Running).unwrap();
        cell
    }

    fn admin_results(sub: &mut crate::events::Subscription) -> Vec<AdminResultEvent> {
        let mut results = Vec::new();
        while let Some(Delivery::Event(envelope)) = sub.try_recv() {
            if let Event::AdminResult(e) = envelope.event {
                results.push(e);
            }
        }
        results
    }

    /// Fails the first `failures` metadata calls with a connection error
    struct FlakyAdmin {
        inner: InMemoryCluster,
        failures: usize,
        transient: bool,
        calls: AtomicUsize,
    }

    impl FlakyAdmin {
        fn new(failures: usize, transient: bool) -> Self {
            Self {
                inner: InMemoryCluster::new(),
                failures,
                transient,
                calls: AtomicUsize::new(0),
            }
        }

        fn fail_if_due(&self) -> kafka_toolkit_client::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.failures {
                Ok(())
            } else if self.transient {
                Err(ClientError::connection("connection reset by peer"))
            } else {
                Err(ClientError::Broker {
                    code: "ClusterAuthorizationFailed".to_string(),
                    message: "not authorized".to_string(),
                })
            }
        }
    }

    #[async_trait]
    impl ClusterAdmin for FlakyAdmin {
        async fn metadata(&self) -> kafka_toolkit_client::Result<ClusterMetadata> {
            self.fail_if_due()?;
            self.inner.metadata().await
        }

        async fn create_topic(&self, spec: &TopicSpec) -> kafka_toolkit_client::Result<()> {
            self.inner.create_topic(spec).await
        }

        async fn delete_topic(&self, name: &str) -> kafka_toolkit_client::Result<()> {
            self.inner.delete_topic(name).await
        }

        async fn list_groups(&self) -> kafka_toolkit_client::Result<Vec<GroupListing>> {
            self.inner.list_groups().await
        }

        async fn register_group(
            &self,
            group_id: &str,
            park: Duration,
        ) -> kafka_toolkit_client::Result<()> {
            self.inner.register_group(group_id, park).await
        }

        async fn delete_group(&self, group_id: &str) -> kafka_toolkit_client::Result<()> {
            self.inner.delete_group(group_id).await
        }
    }

    #[tokio::test]
    async fn test_topic_round_trip() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let admin = AdminClient::new(
            Arc::new(InMemoryCluster::new()),
            state.watch(),
            bus.clone(),
            &settings(),
        );

        admin.create_topic(&TopicSpec::new("t", 3, 1)).await.unwrap();
        assert_eq!(admin.list_topics().await.unwrap(), vec!["t".to_string()]);

        let description = admin.describe_topic("t").await.unwrap();
        assert_eq!(description.partitions.len(), 3);
        assert_eq!(description.replication_factor(), 1);

        admin.delete_topic("t").await.unwrap();
        assert!(admin.list_topics().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_topics() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let admin = AdminClient::new(
            Arc::new(InMemoryCluster::new()),
            state.watch(),
            bus.clone(),
            &settings(),
        );
        let mut sub = bus.subscribe();

        admin.create_topic(&TopicSpec::new("orders", 1, 1)).await.unwrap();
        let err = admin
            .create_topic(&TopicSpec::new("orders", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::AlreadyExists { ref target } if target == "orders"));

        let err = admin.delete_topic("missing").await.unwrap_err();
        assert!(matches!(err, AdminError::NotFound { ref target } if target == "missing"));

        let err = admin.delete_group("nobody").await.unwrap_err();
        assert!(matches!(err, AdminError::NotFound { .. }));

        let results = admin_results(&mut sub);
        assert_eq!(results.len(), 4);
        assert!(results[0].outcome.is_success());
        assert!(results[1..].iter().all(|r| !r.outcome.is_success()));
    }

    #[tokio::test]
    async fn test_invalid_topic_specs_rejected_locally() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let cluster = InMemoryCluster::new();
        cluster.set_reachable(false);
        let admin = AdminClient::new(Arc::new(cluster), state.watch(), bus, &settings());

        for spec in [
            TopicSpec::new("", 1, 1),
            TopicSpec::new("..", 1, 1),
            TopicSpec::new("has space", 1, 1),
            TopicSpec::new("x".repeat(250), 1, 1),
            TopicSpec::new("ok", 0, 1),
            TopicSpec::new("ok", 1, 0),
        ] {
            let err = admin.create_topic(&spec).await.unwrap_err();
            assert!(matches!(err, AdminError::InvalidSpec { .. }), "{:?}", spec);
        }
    }

    #[tokio::test]
    async fn test_not_running_fails_without_contacting_broker() {
        let bus = EventBus::with_capacity(64);
        let state = StateCell::new(bus.clone());
        let flaky = Arc::new(FlakyAdmin::new(0, true));
        let admin = AdminClient::new(flaky.clone(), state.watch(), bus.clone(), &settings());
        let mut sub = bus.subscribe();

        let err = admin.list_topics().await.unwrap_err();
        assert!(matches!(err, AdminError::NotRunning { state: BrokerState::Stopped }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);

        // The state check comes before local validation.
        assert!(matches!(
            admin.create_topic(&TopicSpec::new("", 0, 0)).await,
            Err(AdminError::NotRunning { .. })
        ));
        assert!(matches!(
            admin.create_group("").await,
            Err(AdminError::NotRunning { .. })
        ));

        let results = admin_results(&mut sub);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].operation, "list_topics");
        assert!(results.iter().all(|r| !r.outcome.is_success()));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let flaky = Arc::new(FlakyAdmin::new(1, true));
        let admin = AdminClient::new(flaky.clone(), state.watch(), bus, &settings());

        assert!(admin.list_topics().await.unwrap().is_empty());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_transient_failure_exhausts_retries() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let flaky = Arc::new(FlakyAdmin::new(5, true));
        let admin = AdminClient::new(flaky.clone(), state.watch(), bus, &settings());

        let err = admin.list_topics().await.unwrap_err();
        assert!(matches!(
            err,
            AdminError::RetriesExhausted { ref operation, .. } if operation == "list_topics"
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_failure_not_retried() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let flaky = Arc::new(FlakyAdmin::new(5, false));
        let admin = AdminClient::new(flaky.clone(), state.watch(), bus, &settings());

        let err = admin.list_topics().await.unwrap_err();
        assert!(matches!(err, AdminError::Broker { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_groups_and_cluster_info() {
        let bus = EventBus::with_capacity(64);
        let state = running_state(&bus);
        let cluster = InMemoryCluster::new();
        let admin = AdminClient::new(
            Arc::new(cluster.clone()),
            state.watch(),
            bus,
            &settings(),
        );

        admin.create_topic(&TopicSpec::new("events", 2, 1)).await.unwrap();
        admin.create_group("analytics").await.unwrap();

        let groups = admin.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "analytics");
        assert_eq!(groups[0].member_count, 0);

        let info = admin.cluster_info().await.unwrap();
        assert_eq!(info.broker_count, 1);
        assert_eq!(info.topic_count, 1);
        assert_eq!(info.group_count, 1);
        assert_eq!(info.state, BrokerState::Running);

        let producer = cluster.producer().unwrap();
        producer
            .send(ProduceRecord {
                topic: "events".to_string(),
                partition: None,
                key: None,
                value: Bytes::from_static(b"counted"),
            })
            .await
            .unwrap();
        let info = admin.cluster_info().await.unwrap();
        assert!(info.client_metrics.records_sent >= 1);
        assert!(info.client_metrics.bytes_sent >= 7);

        admin.delete_group("analytics").await.unwrap();
        assert!(admin.list_groups().await.unwrap().is_empty());

        assert!(matches!(
            admin.create_group(" ").await,
            Err(AdminError::InvalidSpec { .. })
        ));
    }
}
