//! Endpoint reachability tracking and automatic failover

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

use super::models::NodeEndpoint;

/// Checks whether an upstream node is reachable
#[async_trait::async_trait]
pub trait NodeProbe: Send + Sync {
    async fn is_reachable(&self, endpoint: &NodeEndpoint) -> bool;
}

/// Probe that opens a TCP connection to the endpoint
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl NodeProbe for TcpProbe {
    async fn is_reachable(&self, endpoint: &NodeEndpoint) -> bool {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(node = %endpoint, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(node = %endpoint, "Probe timed out");
                false
            }
        }
    }
}

/// When automatic failover triggers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPolicy {
    pub enabled: bool,
    /// How long the active endpoint must stay unreachable
    pub threshold: Duration,
}

/// Tracks how long the active endpoint has been unreachable
#[derive(Debug)]
pub struct FailoverTracker {
    policy: FailoverPolicy,
    unreachable_since: Option<Instant>,
}

impl FailoverTracker {
    pub fn new(policy: FailoverPolicy) -> Self {
        Self {
            policy,
            unreachable_since: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.policy.enabled
    }

    /// Record one probe result; returns true when it is time to fail over.
    pub fn record(&mut self, reachable: bool, now: Instant) -> bool {
        if !self.policy.enabled || reachable {
            self.unreachable_since = None;
            return false;
        }
        let since = *self.unreachable_since.get_or_insert(now);
        now.duration_since(since) >= self.policy.threshold
    }

    pub fn reset(&mut self) {
        self.unreachable_since = None;
    }
}
