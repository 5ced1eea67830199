pub mod settings;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime knobs for the toolkit. Every field has a default, so an empty
/// environment yields a usable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitSettings {
    // Broker startup
    pub startup_timeout_ms: u64,
    pub probe_initial_backoff_ms: u64,
    pub probe_max_backoff_ms: u64,
    pub probe_connect_timeout_ms: u64,

    // Broker shutdown
    pub graceful_stop_timeout_ms: u64,
    pub kill_wait_timeout_ms: u64,

    // Admin operations
    pub admin_request_timeout_ms: u64,
    pub admin_retry_pause_ms: u64,
    pub group_park_ms: u64,

    // Event delivery
    pub event_buffer_capacity: usize,
    pub event_history_capacity: usize,

    // Simulation
    pub consumer_poll_timeout_ms: u64,
    pub send_timeout_ms: u64,

    pub client_id: String,
}

impl Default for ToolkitSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 60_000,
            probe_initial_backoff_ms: 250,
            probe_max_backoff_ms: 5_000,
            probe_connect_timeout_ms: 1_000,
            graceful_stop_timeout_ms: 30_000,
            kill_wait_timeout_ms: 10_000,
            admin_request_timeout_ms: 10_000,
            admin_retry_pause_ms: 1_000,
            group_park_ms: 5_000,
            event_buffer_capacity: 1_000,
            event_history_capacity: 1_000,
            consumer_poll_timeout_ms: 1_000,
            send_timeout_ms: 30_000,
            client_id: "kafka-toolkit".to_string(),
        }
    }
}

impl ToolkitSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_initial_backoff_ms)
    }

    pub fn probe_max_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_max_backoff_ms)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_connect_timeout_ms)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_timeout_ms)
    }

    pub fn kill_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_wait_timeout_ms)
    }

    pub fn admin_request_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_request_timeout_ms)
    }

    pub fn admin_retry_pause(&self) -> Duration {
        Duration::from_millis(self.admin_retry_pause_ms)
    }

    pub fn group_park(&self) -> Duration {
        Duration::from_millis(self.group_park_ms)
    }

    pub fn consumer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Validate bounds so no timeout or buffer can be zero
    pub fn validate(&self) -> std::result::Result<(), String> {
        let timeouts = [
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("probe_initial_backoff_ms", self.probe_initial_backoff_ms),
            ("probe_max_backoff_ms", self.probe_max_backoff_ms),
            ("probe_connect_timeout_ms", self.probe_connect_timeout_ms),
            ("graceful_stop_timeout_ms", self.graceful_stop_timeout_ms),
            ("kill_wait_timeout_ms", self.kill_wait_timeout_ms),
            ("admin_request_timeout_ms", self.admin_request_timeout_ms),
            ("consumer_poll_timeout_ms", self.consumer_poll_timeout_ms),
            ("send_timeout_ms", self.send_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(format!("{} must be > 0", name));
            }
        }
        if self.event_buffer_capacity == 0 {
            return Err("event_buffer_capacity must be > 0".to_string());
        }
        if self.event_history_capacity == 0 {
            return Err("event_history_capacity must be > 0".to_string());
        }
        if self.probe_initial_backoff_ms > self.probe_max_backoff_ms {
            return Err("probe_initial_backoff_ms must not exceed probe_max_backoff_ms".to_string());
        }
        if self.client_id.trim().is_empty() {
            return Err("client_id must not be empty".to_string());
        }
        Ok(())
    }
}
