//! Admin client for topic and consumer-group management

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::metadata::Metadata;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConsumerConfigBuilder, OffsetReset};
use crate::error::ClientError;
use crate::metrics::global_metrics;
use crate::record::{
    BrokerMetadata, ClusterMetadata, GroupListing, PartitionMetadata, TopicMetadata, TopicSpec,
};
use crate::Result;

/// Control-plane operations against a cluster
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Brokers and topics, internal topics included
    async fn metadata(&self) -> Result<ClusterMetadata>;

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()>;

    async fn delete_topic(&self, name: &str) -> Result<()>;

    async fn list_groups(&self) -> Result<Vec<GroupListing>>;

    /// Make the coordinator aware of `group_id` by joining it with a
    /// short-lived consumer, holding the membership for at most `park`.
    async fn register_group(&self, group_id: &str, park: Duration) -> Result<()>;

    async fn delete_group(&self, group_id: &str) -> Result<()>;
}

/// [`ClusterAdmin`] backed by librdkafka
pub struct KafkaAdmin {
    config: ClientConfig,
    admin: AdminClient<DefaultClientContext>,
    metadata_consumer: Arc<BaseConsumer>,
}

impl KafkaAdmin {
    /// Create a new admin client. librdkafka connects lazily, so this only
    /// fails on invalid configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let rd_config = config.to_rdkafka();
        let admin = rd_config
            .create::<AdminClient<DefaultClientContext>>()
            .map_err(|e| ClientError::from_kafka(e, "admin client"))?;
        let metadata_consumer = rd_config
            .create::<BaseConsumer>()
            .map_err(|e| ClientError::from_kafka(e, "metadata client"))?;

        Ok(Self {
            config,
            admin,
            metadata_consumer: Arc::new(metadata_consumer),
        })
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new()
            .request_timeout(Some(self.config.request_timeout))
            .operation_timeout(Some(self.config.request_timeout))
    }

    async fn user_topics(&self) -> Result<Vec<String>> {
        let metadata = self.metadata().await?;
        Ok(metadata
            .topics
            .into_iter()
            .filter(|t| !t.is_internal())
            .map(|t| t.name)
            .collect())
    }
}

fn convert_metadata(metadata: &Metadata) -> ClusterMetadata {
    let brokers = metadata
        .brokers()
        .iter()
        .map(|b| BrokerMetadata {
            id: b.id(),
            host: b.host().to_string(),
            port: b.port(),
        })
        .collect();

    let topics = metadata
        .topics()
        .iter()
        .filter(|t| t.error().is_none())
        .map(|t| TopicMetadata {
            name: t.name().to_string(),
            partitions: t
                .partitions()
                .iter()
                .map(|p| PartitionMetadata {
                    id: p.id(),
                    leader: p.leader(),
                    replicas: p.replicas().to_vec(),
                    isr: p.isr().to_vec(),
                })
                .collect(),
        })
        .collect();

    ClusterMetadata { brokers, topics }
}

fn join_error(e: tokio::task::JoinError) -> ClientError {
    ClientError::connection(format!("blocking metadata task failed: {}", e))
}

#[async_trait]
impl ClusterAdmin for KafkaAdmin {
    async fn metadata(&self) -> Result<ClusterMetadata> {
        let consumer = self.metadata_consumer.clone();
        let timeout = self.config.request_timeout;

        let result = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| convert_metadata(&metadata))
        })
        .await
        .map_err(join_error)?
        .map_err(|e| ClientError::from_kafka(e, "metadata"));

        global_metrics().record_admin_request(result.is_ok());
        result
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );

        let results = self
            .admin
            .create_topics(&[topic], &self.admin_options())
            .await
            .map_err(|e| ClientError::from_kafka(e, &spec.name))?;

        for result in results {
            if let Err((name, code)) = result {
                global_metrics().record_admin_request(false);
                return Err(ClientError::from_code(code, &name));
            }
        }

        global_metrics().record_admin_request(true);
        info!(
            "Created topic '{}' ({} partitions, replication {})",
            spec.name, spec.partitions, spec.replication_factor
        );
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        let results = self
            .admin
            .delete_topics(&[name], &self.admin_options())
            .await
            .map_err(|e| ClientError::from_kafka(e, name))?;

        for result in results {
            if let Err((topic, code)) = result {
                global_metrics().record_admin_request(false);
                return Err(ClientError::from_code(code, &topic));
            }
        }

        global_metrics().record_admin_request(true);
        info!("Deleted topic '{}'", name);
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<GroupListing>> {
        let consumer = self.metadata_consumer.clone();
        let timeout = self.config.request_timeout;

        let result = tokio::task::spawn_blocking(move || {
            consumer.fetch_group_list(None, timeout).map(|list| {
                list.groups()
                    .iter()
                    .map(|g| GroupListing {
                        group_id: g.name().to_string(),
                        state: g.state().to_string(),
                        protocol_type: g.protocol_type().to_string(),
                        member_count: g.members().len(),
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(join_error)?
        .map_err(|e| ClientError::from_kafka(e, "group list"));

        global_metrics().record_admin_request(result.is_ok());
        result
    }

    async fn register_group(&self, group_id: &str, park: Duration) -> Result<()> {
        let topics = self.user_topics().await?;
        if topics.is_empty() {
            return Err(ClientError::invalid_config(format!(
                "cannot register group '{}': the cluster has no topics to subscribe to",
                group_id
            )));
        }

        let consumer_config = ConsumerConfigBuilder::new()
            .client_config(self.config.clone())
            .group_id(group_id)
            .topics(topics.clone())
            .offset_reset(OffsetReset::Latest)
            .build();
        consumer_config.validate()?;

        let consumer: StreamConsumer = consumer_config
            .to_rdkafka()
            .create()
            .map_err(|e| ClientError::from_kafka(e, group_id))?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| ClientError::from_kafka(e, group_id))?;

        // Group membership is only established while the consumer is polled.
        let deadline = Instant::now() + park;
        let mut joined = false;
        while Instant::now() < deadline {
            if consumer
                .assignment()
                .map(|assignment| assignment.count() > 0)
                .unwrap_or(false)
            {
                joined = true;
                break;
            }
            let _ = tokio::time::timeout(Duration::from_millis(200), consumer.recv()).await;
        }

        if !joined {
            global_metrics().record_admin_request(false);
            return Err(ClientError::timeout(format!(
                "group '{}' received no assignment within {:?}",
                group_id, park
            )));
        }

        if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing consumed yet is the common case here.
            debug!("Initial commit for group '{}' skipped: {}", group_id, e);
        }

        global_metrics().record_admin_request(true);
        info!("Registered consumer group '{}'", group_id);
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let results = self
            .admin
            .delete_groups(&[group_id], &self.admin_options())
            .await
            .map_err(|e| ClientError::from_kafka(e, group_id))?;

        for result in results {
            if let Err((group, code)) = result {
                global_metrics().record_admin_request(false);
                warn!("Deleting group '{}' failed: {}", group, code);
                return Err(ClientError::from_code(code, &group));
            }
        }

        global_metrics().record_admin_request(true);
        info!("Deleted consumer group '{}'", group_id);
        Ok(())
    }
}
