//! Supervisor models - shared types for lifecycle and health reporting

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::release::ValidatorRelease;

/// Upstream consensus node the validator client connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    /// Login for SSH-based access to the node host
    #[serde(default)]
    pub user: Option<String>,
    /// SSH identity used for tunnels and backup copies
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            identity_file: None,
        }
    }

    /// Host names and IP literals only: ASCII letters, digits and `.-_:`.
    pub fn is_valid_host(host: &str) -> bool {
        !host.is_empty()
            && host.len() <= 253
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

//=============================================================================
// LIFECYCLE
//=============================================================================

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Locked,
    Unlocking,
    Starting,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Exited,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Exited)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Locked => "locked",
            Self::Unlocking => "unlocking",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting_down",
            Self::Exited => "exited",
        };
        f.write_str(name)
    }
}

//=============================================================================
// HEALTH
//=============================================================================

/// Composite snapshot returned by `get_health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub unlocked: bool,
    pub validator_running: bool,
    /// Active endpoint as `[host, port]`
    pub connected_node: (String, u16),
    pub validator_release: ValidatorRelease,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
}

/// Outcome of an on-demand backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupReport {
    pub path: PathBuf,
    pub file_count: usize,
    pub size_bytes: u64,
    /// Whether the archive was copied to the active node
    pub pushed: bool,
}
