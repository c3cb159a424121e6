//! Off-host transport for backup archives
//!
//! The supervisor treats the remote side as opaque: it only hands a
//! [`RemoteDescriptor`] to a [`BackupTransport`]. The shipped transport
//! shells out to `scp` using the same SSH identity as the node endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::supervisor::models::NodeEndpoint;

/// Default upper bound for a single copy
const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(300);

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Copy failed with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Copy timed out after {0:?}")]
    Timeout(Duration),
}

/// Where an archive lives on durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    /// Path on the remote host
    pub path: String,
}

impl RemoteDescriptor {
    /// Address an archive on the host behind a node endpoint.
    pub fn for_endpoint(endpoint: &NodeEndpoint, path: impl Into<String>) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            user: endpoint.user.clone(),
            identity_file: endpoint.identity_file.clone(),
            path: path.into(),
        }
    }

    /// `[user@]host:path`
    pub fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}:{}", user, self.host, self.path),
            None => format!("{}:{}", self.host, self.path),
        }
    }
}

/// Moves archives to and from durable storage
#[async_trait::async_trait]
pub trait BackupTransport: Send + Sync {
    async fn push(&self, local_path: &Path, remote: &RemoteDescriptor) -> Result<(), TransportError>;
    async fn pull(&self, remote: &RemoteDescriptor, local_path: &Path) -> Result<(), TransportError>;
}

/// `scp` based transport
#[derive(Debug, Clone)]
pub struct ScpTransport {
    program: String,
    timeout: Duration,
}

impl Default for ScpTransport {
    fn default() -> Self {
        Self {
            program: "scp".to_string(),
            timeout: DEFAULT_COPY_TIMEOUT,
        }
    }
}

impl ScpTransport {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Arguments for one copy from `src` to `dst`.
    pub fn copy_args(remote: &RemoteDescriptor, src: &str, dst: &str) -> Vec<String> {
        let mut args = vec![
            "-B".to_string(),
            "-q".to_string(),
            "-P".to_string(),
            remote.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &remote.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(src.to_string());
        args.push(dst.to_string());
        args
    }

    async fn copy(&self, remote: &RemoteDescriptor, src: &str, dst: &str) -> Result<(), TransportError> {
        let args = Self::copy_args(remote, src, dst);
        debug!(program = %self.program, ?args, "Running backup copy");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|source| TransportError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TransportError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackupTransport for ScpTransport {
    async fn push(&self, local_path: &Path, remote: &RemoteDescriptor) -> Result<(), TransportError> {
        let src = local_path.display().to_string();
        self.copy(remote, &src, &remote.target()).await?;
        info!(host = %remote.host, path = %remote.path, "Backup pushed");
        Ok(())
    }

    async fn pull(&self, remote: &RemoteDescriptor, local_path: &Path) -> Result<(), TransportError> {
        let dst = local_path.display().to_string();
        self.copy(remote, &remote.target(), &dst).await?;
        info!(host = %remote.host, path = %remote.path, "Backup pulled");
        Ok(())
    }
}
