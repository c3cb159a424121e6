//! Top-level error type

use crate::backup::{BackupError, TransportError};
use crate::config::ConfigError;
use crate::keys::KeyError;
use crate::process::LaunchError;
use crate::release::ReleaseError;
use crate::rpc::RpcError;
use crate::supervisor::models::LifecycleState;

/// Errors surfaced by supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Release error: {0}")]
    Release(#[from] ReleaseError),

    #[error("Backup transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control channel error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation requires a stopped validator (state: {0})")]
    NotStopped(LifecycleState),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Supervisor is not available")]
    Unavailable,

    #[error("Supervisor is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
