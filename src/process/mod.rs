//! Process execution backend
//!
//! The supervisor never spawns anything itself. It asks a [`ProcessBackend`]
//! to launch the validator client and gets back an opaque
//! [`ProcessHandle`] it can poll and terminate.

pub mod command;
pub mod ports;
pub mod telemetry;

use std::path::Path;

use crate::release::ValidatorRelease;
use crate::supervisor::models::NodeEndpoint;

pub use command::{ChildProcess, CommandBackend, CommandTemplate};
pub use telemetry::TelemetryAgent;

/// Everything a backend needs to start one validator process
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub release: &'a ValidatorRelease,
    pub network: &'a str,
    pub data_dir: &'a Path,
    pub logs_dir: &'a Path,
    pub node: &'a NodeEndpoint,
    /// Port reserved from the configured range for ancillary listeners
    pub local_port: u16,
    pub container_name: &'a str,
}

/// Launch errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Release artifact rejected: {0}")]
    ChecksumMismatch(String),

    #[error("Release artifact unavailable: {0}")]
    Artifact(String),

    #[error("Invalid command template: {0}")]
    Template(String),

    #[error("No free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },
}

/// Launches validator processes
#[async_trait::async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// A launched process
#[async_trait::async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, `None` once the process has exited
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Stop the process and release its resources. Safe to call twice.
    async fn terminate(&mut self);
}
