//! Cloneable handle for talking to a running supervisor loop

use tokio::sync::{mpsc, oneshot, watch};

use super::models::{BackupReport, Health};
use crate::error::{Result, SupervisorError};
use crate::release::ValidatorRelease;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests processed by the supervisor loop in arrival order
#[derive(Debug)]
pub enum SupervisorCommand {
    StopValidator { reply: Reply<bool> },
    StartValidator { reply: Reply<bool> },
    SetValidatorRelease { release: ValidatorRelease, reply: Reply<()> },
    ConnectTo { host: String, port: u16, reply: Reply<()> },
    Backup { reply: Reply<BackupReport> },
}

impl SupervisorCommand {
    /// Answer the command with `error` without executing it.
    pub fn reject(self, error: impl Fn() -> SupervisorError) {
        match self {
            Self::StopValidator { reply } | Self::StartValidator { reply } => {
                let _ = reply.send(Err(error()));
            }
            Self::SetValidatorRelease { reply, .. } | Self::ConnectTo { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Self::Backup { reply } => {
                let _ = reply.send(Err(error()));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    health: watch::Receiver<Health>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<SupervisorCommand>,
        health: watch::Receiver<Health>,
    ) -> Self {
        Self { commands, health }
    }

    /// Latest published snapshot. Never waits on the loop.
    pub fn health(&self) -> Health {
        self.health.borrow().clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for_health(&self, predicate: impl FnMut(&Health) -> bool) -> Result<Health> {
        let mut health = self.health.clone();
        let snapshot = health
            .wait_for(predicate)
            .await
            .map_err(|_| SupervisorError::Unavailable)?;
        Ok(snapshot.clone())
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> SupervisorCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SupervisorError::Unavailable)?;
        response.await.map_err(|_| SupervisorError::Unavailable)?
    }

    /// Returns true iff a validator process was running.
    pub async fn stop_validator(&self) -> Result<bool> {
        self.request(|reply| SupervisorCommand::StopValidator { reply }).await
    }

    /// Returns false if the validator was already running.
    pub async fn start_validator(&self) -> Result<bool> {
        self.request(|reply| SupervisorCommand::StartValidator { reply }).await
    }

    pub async fn set_validator_release(&self, release: ValidatorRelease) -> Result<()> {
        self.request(|reply| SupervisorCommand::SetValidatorRelease { release, reply })
            .await
    }

    pub async fn connect_to(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let host = host.into();
        self.request(|reply| SupervisorCommand::ConnectTo { host, port, reply })
            .await
    }

    pub async fn backup(&self) -> Result<BackupReport> {
        self.request(|reply| SupervisorCommand::Backup { reply }).await
    }
}
