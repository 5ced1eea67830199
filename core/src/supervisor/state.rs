use std::fmt;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::events::{Event, EventBus, LifecycleEvent};

/// Lifecycle of the supervised broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BrokerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

impl BrokerState {
    pub fn is_running(&self) -> bool {
        matches!(self, BrokerState::Running)
    }

    /// `start` is only accepted from these states
    pub fn can_start(&self) -> bool {
        matches!(self, BrokerState::Stopped | BrokerState::Failed(_))
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerState::Stopped => f.write_str("Stopped"),
            BrokerState::Starting => f.write_str("Starting"),
            BrokerState::Running => f.write_str("Running"),
            BrokerState::Stopping => f.write_str("Stopping"),
            BrokerState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Read-only, cloneable view of the broker state
#[derive(Debug, Clone)]
pub struct StateWatch {
    receiver: watch::Receiver<BrokerState>,
}

impl StateWatch {
    /// Non-blocking snapshot
    pub fn current(&self) -> BrokerState {
        self.receiver.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.receiver.borrow().is_running()
    }

    /// Wait for the next transition and return the new state. Returns the
    /// current state immediately if the supervisor is gone.
    pub async fn changed(&mut self) -> BrokerState {
        let _ = self.receiver.changed().await;
        self.receiver.borrow_and_update().clone()
    }

    /// Wait until `predicate` holds for the current state
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> BrokerState
    where
        F: FnMut(&BrokerState) -> bool,
    {
        let reached = self
            .receiver
            .wait_for(|state| predicate(state))
            .await
            .map(|state| state.clone());

        match reached {
            Ok(state) => state,
            Err(_) => self.current(),
        }
    }
}

/// The single writable broker state. Every change goes through
/// [`StateCell::transition`], which publishes the matching lifecycle event
/// while the new value is installed, so observers see transitions in order.
pub(crate) struct StateCell {
    sender: watch::Sender<BrokerState>,
    bus: EventBus,
}

impl StateCell {
    pub(crate) fn new(bus: EventBus) -> Self {
        let (sender, _) = watch::channel(BrokerState::Stopped);
        Self { sender, bus }
    }

    pub(crate) fn watch(&self) -> StateWatch {
        StateWatch {
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn current(&self) -> BrokerState {
        self.sender.borrow().clone()
    }

    /// Compare-and-set: install `next` if `allowed` accepts the current
    /// state. Returns the previous state, or the current one on refusal.
    pub(crate) fn transition<F>(&self, allowed: F, next: BrokerState) -> Result<BrokerState, BrokerState>
    where
        F: FnOnce(&BrokerState) -> bool,
    {
        let mut result = None;

        self.sender.send_if_modified(|state| {
            if !allowed(state) {
                result = Some(Err(state.clone()));
                return false;
            }

            let old = std::mem::replace(state, next.clone());
            info!("Broker state {} -> {}", old, next);
            self.bus.publish(Event::Lifecycle(LifecycleEvent {
                old: old.clone(),
                new: next.clone(),
                timestamp: Utc::now(),
            }));
            result = Some(Ok(old));
            true
        });

        result.unwrap_or_else(|| Err(self.current()))
    }
}
