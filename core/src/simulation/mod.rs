//! Producer and consumer simulation.
//!
//! Each job runs on its own task. Producer jobs send on demand
//! ([`SimulationEngine::send_once`]) or on a fixed [`Cadence`]; consumer jobs
//! join a group and report every record with the partition and offset the
//! broker assigned. Every send, receive and status change is published on the
//! [`EventBus`].

mod job;
mod payload;

pub use job::{Cadence, JobId, JobRole, JobSnapshot, JobStatus};
pub use payload::PAYLOAD_SOURCE;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use kafka_toolkit_client::{
    BrokerConnector, ClientError, ProduceMetadata, ProduceRecord, RecordReceiver, RecordSender,
};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ToolkitSettings;
use crate::events::{Direction, EventBus, MessageEvent, Outcome};
use crate::supervisor::{BrokerState, StateWatch};
use job::Job;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Send from {job} failed: {source}")]
    SendFailed {
        job: JobId,
        #[source]
        source: ClientError,
    },

    #[error("Receive in {job} failed: {source}")]
    ReceiveFailed {
        job: JobId,
        #[source]
        source: ClientError,
    },

    #[error("No such job: {0}")]
    JobNotFound(JobId),

    #[error("Broker is not running (state: {state})")]
    NotRunning { state: BrokerState },

    #[error("{job} is a consumer job; only producer jobs can send")]
    NotProducer { job: JobId },

    #[error("{job} is {status}; start a new job to send again")]
    JobNotActive { job: JobId, status: JobStatus },

    #[error("Invalid cadence: {reason}")]
    InvalidCadence { reason: String },

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

impl SimulationError {
    /// Failures that end a job: the connection is gone or the broker stopped
    fn is_fatal(&self) -> bool {
        match self {
            SimulationError::SendFailed { source, .. }
            | SimulationError::ReceiveFailed { source, .. } => source.is_transient(),
            SimulationError::NotRunning { .. } => true,
            _ => false,
        }
    }
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Runs simulation jobs against one broker
pub struct SimulationEngine {
    connector: Arc<dyn BrokerConnector>,
    state: StateWatch,
    bus: EventBus,
    send_timeout: Duration,
    poll_timeout: Duration,
    jobs: DashMap<JobId, Arc<Job>>,
    next_id: AtomicU64,
}

impl SimulationEngine {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        state: StateWatch,
        bus: EventBus,
        settings: &ToolkitSettings,
    ) -> Self {
        Self {
            connector,
            state,
            bus,
            send_timeout: settings.send_timeout(),
            poll_timeout: settings.consumer_poll_timeout(),
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn ensure_running(&self) -> Result<(), SimulationError> {
        let state = self.state.current();
        if state.is_running() {
            Ok(())
        } else {
            Err(SimulationError::NotRunning { state })
        }
    }

    fn allocate_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn job(&self, id: JobId) -> Result<Arc<Job>, SimulationError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SimulationError::JobNotFound(id))
    }

    /// Start a producer on `topic`. With [`Cadence::Every`] the job sends a
    /// generated record every interval until stopped.
    pub fn start_producer(&self, topic: &str, cadence: Cadence) -> Result<JobId, SimulationError> {
        if cadence == Cadence::Every(Duration::ZERO) {
            return Err(SimulationError::InvalidCadence {
                reason: "interval must be greater than zero".to_string(),
            });
        }
        self.ensure_running()?;

        let producer = self.connector.producer()?;
        let id = self.allocate_id();
        let job = Arc::new(Job::new(
            id,
            topic.to_string(),
            JobRole::Producer { cadence },
            Some(producer.clone()),
        ));
        self.jobs.insert(id, job.clone());
        job.start(&self.bus);
        info!("{} producing to '{}' ({:?})", id, topic, cadence);

        if let Cadence::Every(period) = cadence {
            tokio::spawn(run_producer(
                job,
                producer,
                self.state.clone(),
                self.bus.clone(),
                period,
                self.send_timeout,
            ));
        }
        Ok(id)
    }

    /// Start a consumer on `topic` as a member of `group_id`
    pub fn start_consumer(&self, topic: &str, group_id: &str) -> Result<JobId, SimulationError> {
        self.ensure_running()?;

        let receiver = self.connector.consumer(group_id, topic)?;
        let id = self.allocate_id();
        let job = Arc::new(Job::new(
            id,
            topic.to_string(),
            JobRole::Consumer {
                group_id: group_id.to_string(),
            },
            None,
        ));
        self.jobs.insert(id, job.clone());
        job.start(&self.bus);
        info!("{} consuming '{}' in group '{}'", id, topic, group_id);

        tokio::spawn(run_consumer(
            job,
            receiver,
            self.state.clone(),
            self.bus.clone(),
            self.poll_timeout,
        ));
        Ok(id)
    }

    /// Stop and forget a job. No event for `id` is published after this
    /// returns.
    ///
    /// Jobs that ended in [`JobStatus::Error`] stay registered so their
    /// failure can still be inspected; call this on them to release them.
    pub fn stop_job(&self, id: JobId) -> Result<(), SimulationError> {
        let (_, job) = self
            .jobs
            .remove(&id)
            .ok_or(SimulationError::JobNotFound(id))?;
        job.stop(&self.bus);
        Ok(())
    }

    /// Stop every job; returns how many were stopped
    pub fn stop_all(&self) -> usize {
        let ids: Vec<JobId> = self.jobs.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.stop_job(*id).is_ok())
            .count()
    }

    /// Send one record through a producer job and wait for the broker's
    /// acknowledgement.
    pub async fn send_once(
        &self,
        id: JobId,
        key: Option<&str>,
        value: &str,
    ) -> Result<ProduceMetadata, SimulationError> {
        let job = self.job(id)?;
        let producer = match (&job.role, &job.producer) {
            (JobRole::Producer { .. }, Some(producer)) => producer.clone(),
            _ => return Err(SimulationError::NotProducer { job: id }),
        };
        let status = job.status();
        if status != JobStatus::Running {
            return Err(SimulationError::JobNotActive { job: id, status });
        }
        self.ensure_running()?;

        send_record(&job, producer.as_ref(), &self.bus, key, value, self.send_timeout).await
    }

    pub fn job_status(&self, id: JobId) -> Result<JobSnapshot, SimulationError> {
        self.job(id).map(|job| job.snapshot())
    }

    /// Snapshots of all registered jobs, ordered by id. Includes failed jobs
    /// until they are passed to [`SimulationEngine::stop_job`].
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.jobs.iter().map(|entry| entry.snapshot()).collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

impl Drop for SimulationEngine {
    fn drop(&mut self) {
        for entry in self.jobs.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Send and publish the outcome. The event is dropped if the job stopped
/// while the send was in flight.
async fn send_record(
    job: &Job,
    producer: &dyn RecordSender,
    bus: &EventBus,
    key: Option<&str>,
    value: &str,
    timeout: Duration,
) -> Result<ProduceMetadata, SimulationError> {
    let record = ProduceRecord {
        topic: job.topic.clone(),
        partition: None,
        key: key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
        value: Bytes::copy_from_slice(value.as_bytes()),
    };

    let sent = match tokio::time::timeout(timeout, producer.send(record)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::timeout(format!(
            "no acknowledgement within {:?}",
            timeout
        ))),
    };

    let mut event = MessageEvent {
        job_id: job.id,
        direction: Direction::Sent,
        key: key.map(str::to_string),
        value: value.to_string(),
        partition: None,
        offset: None,
        outcome: Outcome::Success,
        timestamp: Utc::now(),
    };

    match sent {
        Ok(metadata) => {
            event.partition = Some(metadata.partition);
            event.offset = Some(metadata.offset);
            job.publish_message(bus, event);
            Ok(metadata)
        }
        Err(source) => {
            event.outcome = Outcome::failure(&source);
            job.publish_message(bus, event);
            Err(SimulationError::SendFailed { job: job.id, source })
        }
    }
}

async fn run_producer(
    job: Arc<Job>,
    producer: Arc<dyn RecordSender>,
    state: StateWatch,
    bus: EventBus,
    period: Duration,
    send_timeout: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = job.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = state.current();
        if !current.is_running() {
            let err = SimulationError::NotRunning { state: current };
            job.fail(&bus, None, err.to_string());
            break;
        }

        let (key, value) = payload::generate(job.id, job.next_message_number());
        let result = send_record(
            &job,
            producer.as_ref(),
            &bus,
            Some(&key),
            &value,
            send_timeout,
        )
        .await;

        if let Err(err) = result {
            if err.is_fatal() {
                job.fail(&bus, None, err.to_string());
                break;
            }
            debug!("{}: {}", job.id, err);
        }
    }
    debug!("{} producer worker finished", job.id);
}

async fn run_consumer(
    job: Arc<Job>,
    mut receiver: Box<dyn RecordReceiver>,
    state: StateWatch,
    bus: EventBus,
    poll_timeout: Duration,
) {
    loop {
        let polled = tokio::select! {
            _ = job.cancel.cancelled() => break,
            polled = receiver.recv(poll_timeout) => polled,
        };

        match polled {
            Ok(Some(record)) => {
                job.publish_message(
                    &bus,
                    MessageEvent {
                        job_id: job.id,
                        direction: Direction::Received,
                        key: record.key.as_ref().map(text),
                        value: text(&record.value),
                        partition: Some(record.partition),
                        offset: Some(record.offset),
                        outcome: Outcome::Success,
                        timestamp: Utc::now(),
                    },
                );
            }
            Ok(None) => {
                let current = state.current();
                if !current.is_running() {
                    let err = SimulationError::NotRunning { state: current };
                    job.fail(&bus, None, err.to_string());
                    break;
                }
            }
            Err(source) => {
                let err = SimulationError::ReceiveFailed {
                    job: job.id,
                    source,
                };
                let failed = MessageEvent {
                    job_id: job.id,
                    direction: Direction::Received,
                    key: None,
                    value: String::new(),
                    partition: None,
                    offset: None,
                    outcome: Outcome::failure(&err),
                    timestamp: Utc::now(),
                };
                if err.is_fatal() {
                    job.fail(&bus, Some(failed), err.to_string());
                    break;
                }
                job.publish_message(&bus, failed);
            }
        }
    }
    debug!("{} consumer worker finished", job.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Delivery, Event, Subscription};
    use crate::supervisor::StateCell;
    use kafka_toolkit_client::{ClusterAdmin, InMemoryCluster, TopicSpec};

    struct Fixture {
        cluster: InMemoryCluster,
        state: StateCell,
        bus: EventBus,
        engine: SimulationEngine,
    }

    async fn fixture() -> Fixture {
        let cluster = InMemoryCluster::new();
        cluster
            .create_topic(&TopicSpec::new("orders", 3, 1))
            .await
            .unwrap();

        let bus = EventBus::with_capacity(1024);
        let state = StateCell::new(bus.clone());
        state.transition(|_| true, BrokerState::Running).unwrap();

        let settings = ToolkitSettings {
            consumer_poll_timeout_ms: 50,
            send_timeout_ms: 1_000,
            ..ToolkitSettings::default()
        };
        let engine = SimulationEngine::new(
            Arc::new(cluster.clone()),
            state.watch(),
            bus.clone(),
            &settings,
        );
        Fixture {
            cluster,
            state,
            bus,
            engine,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<Event> {
        std::iter::from_fn(|| match sub.try_recv() {
            Some(Delivery::Event(envelope)) => Some(envelope.event),
            Some(Delivery::Gap { .. }) => panic!("unexpected gap"),
            None => None,
        })
        .collect()
    }

    fn sent_messages(events: &[Event], id: JobId) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(e, Event::Message(m)
                    if m.job_id == id && m.direction == Direction::Sent && m.outcome.is_success())
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_producer_and_stop() {
        let f = fixture().await;
        let mut sub = f.bus.subscribe();

        let id = f
            .engine
            .start_producer("orders", Cadence::Every(Duration::from_millis(100)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        f.engine.stop_job(id).unwrap();

        let events = drain(&mut sub);
        let sent = sent_messages(&events, id);
        assert!((9..=11).contains(&sent), "sent {}", sent);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let after = drain(&mut sub);
        assert!(after.iter().all(|e| e.job_id() != Some(id)), "{:?}", after);
        assert_eq!(f.cluster.record_count("orders"), sent);
        assert!(matches!(f.engine.job_status(id), Err(SimulationError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_consumer_reports_broker_positions() {
        let f = fixture().await;
        let mut sub = f.bus.subscribe();

        let consumer = f.engine.start_consumer("orders", "sim-group").unwrap();
        let producer = f.engine.start_producer("orders", Cadence::Manual).unwrap();
        let metadata = f
            .engine
            .send_once(producer, Some("user-1"), "hello")
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Delivery::Event(envelope)) = sub.recv().await {
                    if let Event::Message(m) = envelope.event {
                        if m.job_id == consumer {
                            return m;
                        }
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(received.direction, Direction::Received);
        assert_eq!(received.key.as_deref(), Some("user-1"));
        assert_eq!(received.value, "hello");
        assert_eq!(received.partition, Some(metadata.partition));
        assert_eq!(received.offset, Some(metadata.offset));

        let jobs = f.engine.list_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, consumer);
        assert_eq!(jobs[1].sent, 1);

        assert_eq!(f.engine.stop_all(), 2);
        assert!(f.engine.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_job_preconditions() {
        let f = fixture().await;

        let consumer = f.engine.start_consumer("orders", "g").unwrap();
        assert!(matches!(
            f.engine.send_once(consumer, None, "x").await,
            Err(SimulationError::NotProducer { .. })
        ));
        assert!(matches!(
            f.engine.send_once(JobId(999), None, "x").await,
            Err(SimulationError::JobNotFound(JobId(999)))
        ));
        assert!(matches!(
            f.engine.stop_job(JobId(999)),
            Err(SimulationError::JobNotFound(_))
        ));
        assert!(matches!(
            f.engine.start_producer("orders", Cadence::Every(Duration::ZERO)),
            Err(SimulationError::InvalidCadence { .. })
        ));

        f.state
            .transition(|_| true, BrokerState::Failed("unexpected exit, code 1".into()))
            .unwrap();
        assert!(matches!(
            f.engine.start_producer("orders", Cadence::Manual),
            Err(SimulationError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_not_retried() {
        let f = fixture().await;
        let mut sub = f.bus.subscribe();

        let producer = f.engine.start_producer("missing-topic", Cadence::Manual).unwrap();
        let err = f.engine.send_once(producer, None, "x").await.unwrap_err();
        assert!(matches!(err, SimulationError::SendFailed { .. }));

        let failures: Vec<_> = drain(&mut sub)
            .into_iter()
            .filter_map(|e| match e {
                Event::Message(m) if !m.outcome.is_success() => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(f.engine.job_status(producer).unwrap().status, JobStatus::Running);
        assert_eq!(f.engine.job_status(producer).unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_moves_cadence_job_to_error() {
        let f = fixture().await;
        let id = f
            .engine
            .start_producer("orders", Cadence::Every(Duration::from_millis(100)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut sub = f.bus.subscribe();
        f.cluster.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = f.engine.job_status(id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Error);

        let transitions: Vec<_> = drain(&mut sub)
            .into_iter()
            .filter_map(|e| match e {
                Event::Job(j) => Some((j.old, j.new)),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![(JobStatus::Running, JobStatus::Error)]);

        assert!(matches!(
            f.engine.send_once(id, None, "x").await,
            Err(SimulationError::JobNotActive { status: JobStatus::Error, .. })
        ));
    }

    #[tokio::test]
    async fn test_broker_failure_ends_consumer() {
        let f = fixture().await;
        let id = f.engine.start_consumer("orders", "sim-group").unwrap();

        f.state
            .transition(|_| true, BrokerState::Failed("unexpected exit, code 137".into()))
            .unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = f.engine.job_status(id).unwrap();
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(snapshot.status, JobStatus::Error);

        // Failed jobs stay listed until released.
        let jobs = f.engine.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);

        let mut sub = f.bus.subscribe();
        f.engine.stop_job(id).unwrap();
        assert!(f.engine.list_jobs().is_empty());
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_failure_stops_cadence() {
        let f = fixture().await;
        let id = f
            .engine
            .start_producer("orders", Cadence::Every(Duration::from_millis(100)))
            .unwrap();

        f.state
            .transition(|_| true, BrokerState::Failed("unexpected exit, code 137".into()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(f.engine.job_status(id).unwrap().status, JobStatus::Error);
        assert_eq!(f.cluster.record_count("orders"), 0);
    }
}
