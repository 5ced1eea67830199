use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use crate::inspector::Endpoint;

/// Lightweight "is the broker answering yet" check
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self) -> bool;

    /// What is being probed, for log and error messages
    fn describe(&self) -> String;
}

/// Succeeds as soon as a TCP connection to any endpoint is accepted
#[derive(Debug, Clone)]
pub struct TcpProbe {
    endpoints: Vec<Endpoint>,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(endpoints: Vec<Endpoint>, connect_timeout: Duration) -> Self {
        Self {
            endpoints,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self) -> bool {
        for endpoint in &self.endpoints {
            let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => trace!("Probe {} refused: {}", endpoint, e),
                Err(_) => trace!("Probe {} timed out", endpoint),
            }
        }
        false
    }

    fn describe(&self) -> String {
        self.endpoints
            .iter()
            .map(Endpoint::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Exponential backoff between probes
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}
