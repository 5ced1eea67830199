use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kafka_toolkit_client::RecordSender;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{Direction, Event, EventBus, JobEvent, MessageEvent};

/// Engine-assigned job identifier, displayed as `job-<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Idle,
    Running,
    Stopped,
    Error,
}

impl JobStatus {
    /// `Stopped` and `Error` are final; a new job is needed to resume
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Idle => "Idle",
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

/// How a producer job decides when to send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cadence {
    /// Only on `send_once`
    Manual,
    /// A generated record every interval, until stopped
    Every(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobRole {
    Producer { cadence: Cadence },
    Consumer { group_id: String },
}

impl JobRole {
    pub fn is_producer(&self) -> bool {
        matches!(self, JobRole::Producer { .. })
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub topic: String,
    pub role: JobRole,
    pub status: JobStatus,
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
}

/// Shared between the engine and the job's worker.
///
/// Status checks and event publication happen under the same lock, so once
/// `stop` has returned no further event can be published for this job.
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) topic: String,
    pub(crate) role: JobRole,
    pub(crate) producer: Option<Arc<dyn RecordSender>>,
    pub(crate) cancel: CancellationToken,
    status: Mutex<JobStatus>,
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    message_number: AtomicU64,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        topic: String,
        role: JobRole,
        producer: Option<Arc<dyn RecordSender>>,
    ) -> Self {
        Self {
            id,
            topic,
            role,
            producer,
            cancel: CancellationToken::new(),
            status: Mutex::new(JobStatus::Idle),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            message_number: AtomicU64::new(0),
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    /// Sequence number for the next generated record, starting at 1
    pub(crate) fn next_message_number(&self) -> u64 {
        self.message_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn change(&self, status: &mut JobStatus, next: JobStatus, reason: Option<String>, bus: &EventBus) {
        let old = std::mem::replace(status, next);
        info!("{} {} -> {}", self.id, old, next);
        bus.publish(Event::Job(JobEvent {
            job_id: self.id,
            old,
            new: next,
            reason,
            timestamp: Utc::now(),
        }));
    }

    /// `Idle -> Running`
    pub(crate) fn start(&self, bus: &EventBus) -> bool {
        let mut status = self.status.lock();
        if *status != JobStatus::Idle {
            return false;
        }
        self.change(&mut status, JobStatus::Running, None, bus);
        true
    }

    /// Move a live job to `Stopped` and signal its worker. Terminal jobs keep
    /// their status.
    pub(crate) fn stop(&self, bus: &EventBus) {
        {
            let mut status = self.status.lock();
            if !status.is_terminal() {
                self.change(&mut status, JobStatus::Stopped, None, bus);
            }
        }
        self.cancel.cancel();
    }

    /// `Running -> Error`, publishing the failed message (if any) first
    pub(crate) fn fail(&self, bus: &EventBus, failed: Option<MessageEvent>, reason: String) {
        {
            let mut status = self.status.lock();
            if *status != JobStatus::Running {
                return;
            }
            if let Some(event) = failed {
                self.failed.fetch_add(1, Ordering::Relaxed);
                bus.publish(Event::Message(event));
            }
            warn!("{} failed: {}", self.id, reason);
            self.change(&mut status, JobStatus::Error, Some(reason), bus);
        }
        self.cancel.cancel();
    }

    /// Publish `event` only while the job is running. Returns whether it
    /// was published.
    pub(crate) fn publish_message(&self, bus: &EventBus, event: MessageEvent) -> bool {
        let status = self.status.lock();
        if *status != JobStatus::Running {
            return false;
        }
        let counter = if !event.outcome.is_success() {
            &self.failed
        } else {
            match event.direction {
                Direction::Sent => &self.sent,
                Direction::Received => &self.received,
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        bus.publish(Event::Message(event));
        true
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            topic: self.topic.clone(),
            role: self.role.clone(),
            status: self.status(),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Delivery, Outcome};

    fn message(job: JobId, outcome: Outcome) -> MessageEvent {
        MessageEvent {
            job_id: job,
            direction: Direction::Sent,
            key: Some("k".to_string()),
            value: "v".to_string(),
            partition: Some(0),
            offset: Some(0),
            outcome,
            timestamp: Utc::now(),
        }
    }

    fn job() -> Job {
        Job::new(
            JobId(7),
            "orders".to_string(),
            JobRole::Producer {
                cadence: Cadence::Manual,
            },
            None,
        )
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId(3).to_string(), "job-3");
    }

    #[test]
    fn test_status_machine() {
        let bus = EventBus::with_capacity(16);
        let mut sub = bus.subscribe();
        let job = job();

        assert!(job.start(&bus));
        assert!(!job.start(&bus));
        job.stop(&bus);
        job.stop(&bus);
        job.fail(&bus, None, "late".to_string());
        assert_eq!(job.status(), JobStatus::Stopped);
        assert!(job.cancel.is_cancelled());

        let mut transitions = Vec::new();
        while let Some(Delivery::Event(envelope)) = sub.try_recv() {
            if let Event::Job(e) = envelope.event {
                transitions.push((e.old, e.new));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (JobStatus::Idle, JobStatus::Running),
                (JobStatus::Running, JobStatus::Stopped)
            ]
        );
    }

    #[test]
    fn test_no_messages_after_stop() {
        let bus = EventBus::with_capacity(16);
        let job = job();

        assert!(!job.publish_message(&bus, message(job.id, Outcome::Success)));
        job.start(&bus);
        assert!(job.publish_message(&bus, message(job.id, Outcome::Success)));
        assert!(job.publish_message(&bus, message(job.id, Outcome::failure("boom"))));
        job.stop(&bus);
        assert!(!job.publish_message(&bus, message(job.id, Outcome::Success)));

        let snapshot = job.snapshot();
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.status, JobStatus::Stopped);
    }

    #[test]
    fn test_fail_carries_reason() {
        let bus = EventBus::with_capacity(16);
        let job = job();
        job.start(&bus);
        let mut sub = bus.subscribe();

        job.fail(&bus, Some(message(job.id, Outcome::failure("reset"))), "connection lost".to_string());
        assert_eq!(job.status(), JobStatus::Error);
        assert_eq!(job.snapshot().failed, 1);

        let events: Vec<Event> = std::iter::from_fn(|| match sub.try_recv() {
            Some(Delivery::Event(envelope)) => Some(envelope.event),
            _ => None,
        })
        .collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Message(_)));
        match &events[1] {
            Event::Job(e) => {
                assert_eq!(e.new, JobStatus::Error);
                assert_eq!(e.reason.as_deref(), Some("connection lost"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
