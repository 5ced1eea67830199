//! In-process cluster implementing every client capability.
//!
//! `InMemoryCluster` keeps topics, partition logs and consumer groups in
//! memory so the toolkit can be exercised without a running broker. It follows
//! Kafka semantics where the toolkit can observe them: offsets are assigned
//! per partition, keyed records hash to a stable partition, unknown topics
//! are rejected, and a group with live members cannot be deleted.
//! Reachability can be toggled to simulate a broker that went away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::admin::ClusterAdmin;
use crate::client::BrokerConnector;
use crate::consumer::RecordReceiver;
use crate::error::ClientError;
use crate::metrics::{global_metrics, Timer};
use crate::producer::RecordSender;
use crate::record::{
    BrokerMetadata, ClusterMetadata, ConsumeRecord, GroupListing, PartitionId, PartitionMetadata,
    ProduceMetadata, ProduceRecord, TopicMetadata, TopicSpec,
};
use crate::Result;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Bytes,
    timestamp: i64,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Mutex<Vec<StoredRecord>>>,
    replication_factor: i32,
    next_partition: AtomicUsize,
}

impl TopicLog {
    fn new(partitions: i32, replication_factor: i32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            replication_factor,
            next_partition: AtomicUsize::new(0),
        }
    }

    fn end_offsets(&self) -> Vec<i64> {
        self.partitions.iter().map(|p| p.lock().len() as i64).collect()
    }
}

#[derive(Debug, Default)]
struct GroupState {
    members: usize,
    offsets: HashMap<(String, PartitionId), i64>,
}

#[derive(Debug)]
struct ClusterInner {
    topics: DashMap<String, Arc<TopicLog>>,
    groups: DashMap<String, GroupState>,
    reachable: AtomicBool,
    appended: Notify,
}

/// Kafka stand-in living entirely in the current process
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a, stable across runs so a key always maps to the same partition
fn hash_partition(key: &[u8], partition_count: usize) -> usize {
    let mut hash = 2166136261u32;
    for byte in key {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    (hash as usize) % partition_count
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                topics: DashMap::new(),
                groups: DashMap::new(),
                reachable: AtomicBool::new(true),
                appended: Notify::new(),
            }),
        }
    }

    /// Simulate the broker disappearing (`false`) or coming back (`true`)
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        // Wake consumers so they observe the change.
        self.inner.appended.notify_waiters();
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Number of records stored across all partitions of `topic`
    pub fn record_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(|p| p.lock().len()).sum())
            .unwrap_or(0)
    }

    /// Current member count of `group_id`, if the group exists
    pub fn group_members(&self, group_id: &str) -> Option<usize> {
        self.inner.groups.get(group_id).map(|g| g.members)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(ClientError::connection("broker transport failure: connection refused"))
        }
    }

    fn topic(&self, name: &str) -> Result<Arc<TopicLog>> {
        self.inner
            .topics
            .get(name)
            .map(|log| log.clone())
            .ok_or_else(|| ClientError::TopicNotFound {
                topic: name.to_string(),
            })
    }

    fn join_group(&self, group_id: &str) {
        self.inner
            .groups
            .entry(group_id.to_string())
            .or_default()
            .members += 1;
    }

    fn leave_group(&self, group_id: &str) {
        if let Some(mut group) = self.inner.groups.get_mut(group_id) {
            group.members = group.members.saturating_sub(1);
        }
    }

    fn append(&self, record: ProduceRecord) -> Result<ProduceMetadata> {
        let log = self.topic(&record.topic)?;
        let partition_count = log.partitions.len();

        let partition = match (record.partition, &record.key) {
            (Some(p), _) if p >= 0 && (p as usize) < partition_count => p as usize,
            (Some(p), _) => {
                return Err(ClientError::producer(format!(
                    "partition {} does not exist for topic '{}'",
                    p, record.topic
                )))
            }
            (None, Some(key)) => hash_partition(key, partition_count),
            (None, None) => log.next_partition.fetch_add(1, Ordering::Relaxed) % partition_count,
        };

        let offset = {
            let mut entries = log.partitions[partition].lock();
            entries.push(StoredRecord {
                key: record.key,
                value: record.value,
                timestamp: now_millis(),
            });
            entries.len() as i64 - 1
        };
        self.inner.appended.notify_waiters();

        Ok(ProduceMetadata {
            topic: record.topic,
            partition: partition as PartitionId,
            offset,
        })
    }
}

#[async_trait]
impl ClusterAdmin for InMemoryCluster {
    async fn metadata(&self) -> Result<ClusterMetadata> {
        self.check_reachable()?;

        let mut topics: Vec<TopicMetadata> = self
            .inner
            .topics
            .iter()
            .map(|entry| {
                let replicas: Vec<i32> = (0..entry.replication_factor).collect();
                TopicMetadata {
                    name: entry.key().clone(),
                    partitions: (0..entry.partitions.len() as i32)
                        .map(|id| PartitionMetadata {
                            id,
                            leader: 0,
                            replicas: replicas.clone(),
                            isr: replicas.clone(),
                        })
                        .collect(),
                }
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ClusterMetadata {
            brokers: vec![BrokerMetadata {
                id: 0,
                host: "localhost".to_string(),
                port: 9092,
            }],
            topics,
        })
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        self.check_reachable()?;

        match self.inner.topics.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ClientError::TopicAlreadyExists {
                topic: spec.name.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(TopicLog::new(
                    spec.partitions,
                    spec.replication_factor,
                )));
                debug!("Created in-memory topic '{}'", spec.name);
                Ok(())
            }
        }
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        self.check_reachable()?;

        self.inner
            .topics
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::TopicNotFound {
                topic: name.to_string(),
            })
    }

    async fn list_groups(&self) -> Result<Vec<GroupListing>> {
        self.check_reachable()?;

        let mut groups: Vec<GroupListing> = self
            .inner
            .groups
            .iter()
            .map(|entry| GroupListing {
                group_id: entry.key().clone(),
                state: if entry.members > 0 { "Stable" } else { "Empty" }.to_string(),
                protocol_type: "consumer".to_string(),
                member_count: entry.members,
            })
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(groups)
    }

    async fn register_group(&self, group_id: &str, _park: Duration) -> Result<()> {
        self.check_reachable()?;

        if !self.inner.topics.iter().any(|t| !t.key().starts_with("__")) {
            return Err(ClientError::invalid_config(format!(
                "cannot register group '{}': the cluster has no topics to subscribe to",
                group_id
            )));
        }
        // Join and leave immediately; the group stays behind empty.
        self.inner.groups.entry(group_id.to_string()).or_default();
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.check_reachable()?;

        let members = self
            .inner
            .groups
            .get(group_id)
            .map(|g| g.members)
            .ok_or_else(|| ClientError::GroupNotFound {
                group: group_id.to_string(),
            })?;
        if members > 0 {
            return Err(ClientError::GroupNotEmpty {
                group: group_id.to_string(),
            });
        }
        self.inner.groups.remove(group_id);
        Ok(())
    }
}

#[async_trait]
impl RecordSender for InMemoryCluster {
    async fn send(&self, record: ProduceRecord) -> Result<ProduceMetadata> {
        let timer = Timer::start();
        let size = record.value.len() as u64;

        let result = self.check_reachable().and_then(|_| self.append(record));
        match &result {
            Ok(_) => global_metrics().record_send(size, timer.elapsed()),
            Err(_) => global_metrics().record_send_error(),
        }
        result
    }
}

/// Group member reading one topic of an [`InMemoryCluster`]. Starts at the
/// log end (or the group's committed position) and commits every record it
/// returns. Every member reads every partition.
pub struct InMemoryConsumer {
    cluster: InMemoryCluster,
    group_id: String,
    topic: String,
    positions: HashMap<PartitionId, i64>,
}

impl InMemoryConsumer {
    fn new(cluster: InMemoryCluster, group_id: &str, topic: &str) -> Self {
        cluster.join_group(group_id);
        let mut consumer = Self {
            cluster,
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            positions: HashMap::new(),
        };
        consumer.sync_positions();
        consumer
    }

    /// Pick up partitions that appeared since the last poll (topic created
    /// after subscribing).
    fn sync_positions(&mut self) {
        let Ok(log) = self.cluster.topic(&self.topic) else {
            return;
        };
        let committed = self
            .cluster
            .inner
            .groups
            .get(&self.group_id)
            .map(|g| g.offsets.clone())
            .unwrap_or_default();

        for (partition, end) in log.end_offsets().into_iter().enumerate() {
            let partition = partition as PartitionId;
            self.positions.entry(partition).or_insert_with(|| {
                committed
                    .get(&(self.topic.clone(), partition))
                    .copied()
                    .unwrap_or(end)
            });
        }
    }

    fn poll_once(&mut self) -> Option<ConsumeRecord> {
        let log = self.cluster.topic(&self.topic).ok()?;
        self.sync_positions();

        for (index, entries) in log.partitions.iter().enumerate() {
            let partition = index as PartitionId;
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let stored = entries.lock().get(position as usize).cloned();

            if let Some(stored) = stored {
                self.positions.insert(partition, position + 1);
                if let Some(mut group) = self.cluster.inner.groups.get_mut(&self.group_id) {
                    group
                        .offsets
                        .insert((self.topic.clone(), partition), position + 1);
                }
                return Some(ConsumeRecord {
                    topic: self.topic.clone(),
                    partition,
                    offset: position,
                    key: stored.key,
                    value: stored.value,
                    timestamp: Some(stored.timestamp),
                });
            }
        }
        None
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.cluster.leave_group(&self.group_id);
    }
}

#[async_trait]
impl RecordReceiver for InMemoryConsumer {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<ConsumeRecord>> {
        let deadline = Instant::now() + timeout;
        let inner = self.cluster.inner.clone();

        loop {
            let notified = inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Err(e) = self.cluster.check_reachable() {
                global_metrics().record_consume_error();
                return Err(e);
            }
            if let Some(record) = self.poll_once() {
                global_metrics().record_consume(record.value.len() as u64);
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

impl BrokerConnector for InMemoryCluster {
    fn admin(&self) -> Result<Arc<dyn ClusterAdmin>> {
        Ok(Arc::new(self.clone()))
    }

    fn producer(&self) -> Result<Arc<dyn RecordSender>> {
        Ok(Arc::new(self.clone()))
    }

    fn consumer(&self, group_id: &str, topic: &str) -> Result<Box<dyn RecordReceiver>> {
        Ok(Box::new(InMemoryConsumer::new(self.clone(), group_id, topic)))
    }

    fn bootstrap_servers(&self) -> String {
        "localhost:9092".to_string()
    }
}
