//! Event model and the bus that carries it to observers.
//!
//! Every component publishes onto one [`EventBus`]: broker log lines,
//! lifecycle transitions, simulated messages, admin results and job status
//! changes. Publishing never blocks; the bus keeps a bounded buffer per
//! subscriber and drops the oldest events when a subscriber falls behind,
//! reporting the loss as a [`Delivery::Gap`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

use crate::simulation::{JobId, JobStatus};
use crate::supervisor::BrokerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    pub fn failure<E: fmt::Display>(error: E) -> Self {
        Outcome::Failure(error.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("ok"),
            Outcome::Failure(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub source: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new<S: Into<String>, T: Into<String>>(level: LogLevel, source: S, text: T) -> Self {
        Self {
            level,
            source: source.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub old: BrokerState,
    pub new: BrokerState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub job_id: JobId,
    pub direction: Direction,
    pub key: Option<String>,
    pub value: String,
    /// As reported by the broker; `None` when the send failed
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminResultEvent {
    pub operation: String,
    pub target: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub old: JobStatus,
    pub new: JobStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Log(LogEvent),
    Lifecycle(LifecycleEvent),
    Message(MessageEvent),
    AdminResult(AdminResultEvent),
    Job(JobEvent),
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Log(e) => e.timestamp,
            Event::Lifecycle(e) => e.timestamp,
            Event::Message(e) => e.timestamp,
            Event::AdminResult(e) => e.timestamp,
            Event::Job(e) => e.timestamp,
        }
    }

    /// The simulation job this event belongs to, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::Message(e) => Some(e.job_id),
            Event::Job(e) => Some(e.job_id),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp().format("%H:%M:%S%.3f");
        match self {
            Event::Log(e) => write!(f, "{} [{}] {:<5} {}", ts, e.source, e.level, e.text),
            Event::Lifecycle(e) => write!(f, "{} [broker] {} -> {}", ts, e.old, e.new),
            Event::Message(e) => {
                let arrow = match e.direction {
                    Direction::Sent => "sent",
                    Direction::Received => "received",
                };
                write!(
                    f,
                    "{} [{}] {} key={} partition={} offset={} {} {}",
                    ts,
                    e.job_id,
                    arrow,
                    e.key.as_deref().unwrap_or("-"),
                    e.partition.map_or("-".to_string(), |p| p.to_string()),
                    e.offset.map_or("-".to_string(), |o| o.to_string()),
                    e.outcome,
                    e.value
                )
            }
            Event::AdminResult(e) => {
                write!(f, "{} [admin] {} '{}' {}", ts, e.operation, e.target, e.outcome)
            }
            Event::Job(e) => {
                write!(f, "{} [{}] {} -> {}", ts, e.job_id, e.old, e.new)?;
                if let Some(reason) = &e.reason {
                    write!(f, " ({})", reason)?;
                }
                Ok(())
            }
        }
    }
}

/// An event stamped with its position in the bus
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub seq: u64,
    pub event: Event,
}

/// What a subscription yields
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Envelope),
    /// `missed` events were dropped because this subscriber fell behind
    Gap { missed: u64 },
}

struct BusState {
    next_seq: u64,
    history: VecDeque<Envelope>,
    history_capacity: usize,
}

struct BusInner {
    sender: broadcast::Sender<Envelope>,
    state: Mutex<BusState>,
}

/// Multi-producer, multi-subscriber event channel. Cloning shares the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's backlog, `history_capacity` the
    /// replay buffer served by [`EventBus::history`].
    pub fn new(capacity: usize, history_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                state: Mutex::new(BusState {
                    next_seq: 0,
                    history: VecDeque::with_capacity(history_capacity.min(4096)),
                    history_capacity,
                }),
            }),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, capacity)
    }

    /// Publish without waiting for subscribers. Returns the sequence number.
    pub fn publish(&self, event: Event) -> u64 {
        // Sequence assignment and channel send happen under one lock so every
        // subscriber sees sequence numbers in increasing order.
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let envelope = Envelope { seq, event };
        if state.history_capacity > 0 {
            if state.history.len() == state.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(envelope.clone());
        }

        if self.inner.sender.send(envelope).is_err() {
            trace!("No subscribers for event {}", seq);
        }
        seq
    }

    pub fn log<S: Into<String>, T: Into<String>>(&self, level: LogLevel, source: S, text: T) -> u64 {
        self.publish(Event::Log(LogEvent::new(level, source, text)))
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: Some(self.inner.sender.subscribe()),
        }
    }

    pub fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.unsubscribe();
    }

    /// Up to `n` most recent events, oldest first
    pub fn history(&self, n: usize) -> Vec<Envelope> {
        let state = self.inner.state.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Number of events published so far
    pub fn published(&self) -> u64 {
        self.inner.state.lock().next_seq
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("published", &self.published())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    receiver: Option<broadcast::Receiver<Envelope>>,
}

impl Subscription {
    /// Wait for the next delivery. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(envelope) => Some(Delivery::Event(envelope)),
            Err(RecvError::Lagged(missed)) => Some(Delivery::Gap { missed }),
            Err(RecvError::Closed) => None,
        }
    }

    /// Next delivery if one is already buffered
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let receiver = self.receiver.as_mut()?;
        match receiver.try_recv() {
            Ok(envelope) => Some(Delivery::Event(envelope)),
            Err(TryRecvError::Lagged(missed)) => Some(Delivery::Gap { missed }),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Release the buffer slot. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }
}
