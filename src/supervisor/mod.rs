//! Supervisor - lifecycle and failover state machine
//!
//! One loop task owns every piece of runtime state. The control channel and
//! any other caller reach it through a [`SupervisorHandle`], which queues
//! commands and reads the published [`Health`] snapshot.
//!
//! ```text
//! Locked -> Unlocking -> Starting -> Running -> Stopping -> Stopped
//!                                       ^                      |
//!                                       +------ Starting <-----+
//!
//! any state --(shutdown signal)--> ShuttingDown -> Exited
//! ```

pub mod failover;
pub mod handle;
pub mod models;
pub mod retry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backup::{self, BackupError, BackupTransport, RemoteDescriptor};
use crate::config::Config;
use crate::error::{Result, SupervisorError};
use crate::keys::RootKey;
use crate::process::{ports, LaunchError, LaunchSpec, ProcessBackend, ProcessHandle, TelemetryAgent};
use crate::release::ValidatorRelease;
use crate::rpc::{self, RpcServer, RunningServer, UserRegistry};

pub use failover::{FailoverPolicy, FailoverTracker, NodeProbe, TcpProbe};
pub use handle::{SupervisorCommand, SupervisorHandle};
pub use models::{BackupReport, Health, LifecycleState, NodeEndpoint};
pub use retry::RetryPolicy;

/// Queued commands before senders wait
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Runtime state, owned by the loop
struct SupervisorState {
    unlocked: bool,
    lifecycle: LifecycleState,
    nodes: Vec<NodeEndpoint>,
    active: usize,
    release: ValidatorRelease,
    validator: Option<Box<dyn ProcessHandle>>,
    /// Whether the poller should keep the validator alive
    desired_running: bool,
    last_error: Option<String>,
}

pub struct Supervisor {
    config: Config,
    root_key: RootKey,
    backend: Arc<dyn ProcessBackend>,
    probe: Option<Arc<dyn NodeProbe>>,
    transport: Option<Arc<dyn BackupTransport>>,
    telemetry: Option<TelemetryAgent>,
    shutdown: watch::Receiver<bool>,
    state: SupervisorState,
    retry: RetryPolicy,
    failover: FailoverTracker,
    commands_tx: mpsc::Sender<SupervisorCommand>,
    commands_rx: Option<mpsc::Receiver<SupervisorCommand>>,
    health_tx: watch::Sender<Health>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        root_key: RootKey,
        backend: Arc<dyn ProcessBackend>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let state = SupervisorState {
            unlocked: false,
            lifecycle: LifecycleState::Locked,
            nodes: config.nodes.clone(),
            active: 0,
            release: config.validator.release.clone(),
            validator: None,
            desired_running: false,
            last_error: None,
        };
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (health_tx, _) = watch::channel(snapshot(&state));

        Self {
            retry: config.retry_policy(),
            failover: FailoverTracker::new(config.failover_policy()),
            config,
            root_key,
            backend,
            probe: None,
            transport: None,
            telemetry: None,
            shutdown,
            state,
            commands_tx,
            commands_rx: Some(commands_rx),
            health_tx,
        }
    }

    /// Reachability probe used for automatic failover
    pub fn with_probe(mut self, probe: Arc<dyn NodeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Transport used to push and pull backups
    pub fn with_transport(mut self, transport: Arc<dyn BackupTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryAgent) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle::new(self.commands_tx.clone(), self.health_tx.subscribe())
    }

    /// Address of the control channel
    pub fn rpc_sock_path(&self) -> PathBuf {
        self.config.rpc_socket_path()
    }

    /// Current validator process, `None` when stopped or exited
    pub fn validator_handle(&self) -> Option<&dyn ProcessHandle> {
        self.state.validator.as_deref()
    }

    pub fn health(&self) -> Health {
        self.health_tx.borrow().clone()
    }

    /// Run until the shutdown signal fires.
    ///
    /// Returns an error only when startup fails before the validator was
    /// launched (invalid config, unreadable backup, control channel bind).
    pub async fn run(&mut self) -> Result<()> {
        let mut commands = self.commands_rx.take().ok_or(SupervisorError::AlreadyRunning)?;

        self.transition(LifecycleState::Unlocking);
        let startup = self.start_up().await;
        let server = match startup {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "Supervisor startup failed");
                self.state.last_error = Some(e.to_string());
                self.transition(LifecycleState::Exited);
                return Err(e);
            }
        };

        if !*self.shutdown.borrow() {
            self.state.desired_running = true;
            self.transition(LifecycleState::Starting);
            if let Err(e) = self.launch_with_retry().await {
                warn!(error = %e, "Validator not started");
            }
        }

        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backups = self.config.backup_interval().map(|period| {
            let mut timer = interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut self.shutdown) => {
                    info!("Shutdown signal received");
                    break;
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = poll.tick() => self.poll().await,
                _ = next_tick(&mut backups) => {
                    if let Err(e) = self.backup_now().await {
                        warn!(error = %e, "Periodic backup failed");
                    }
                }
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject(|| SupervisorError::ShuttingDown);
        }
        self.shut_down(server).await;
        Ok(())
    }

    /// Unlock, restore validator data and open the control channel.
    async fn start_up(&mut self) -> Result<Option<RunningServer>> {
        self.config.validate()?;
        self.state.unlocked = true;
        self.transition(LifecycleState::Starting);

        self.restore_backup().await?;

        let Some(tls) = &self.config.tls else {
            warn!("No TLS configuration, control channel disabled");
            return Ok(None);
        };
        let users = UserRegistry::from_hex_map(&self.config.rpc.users)?;
        if users.is_empty() {
            warn!("No rpc users configured, every request will be rejected");
        }
        let server = RpcServer::bind(
            &self.config.rpc_socket_path(),
            rpc::tls::server_config(tls)?,
            users,
            self.handle(),
        )?;
        Ok(Some(server.spawn()))
    }

    async fn restore_backup(&mut self) -> Result<()> {
        let archive = self.config.backup_path();
        let dest = self.config.validator_data_dir();

        if !archive.exists() && self.config.backup.pull_on_boot {
            if let (Some(transport), Some(node)) = (self.transport.clone(), self.active_node().cloned()) {
                let remote = RemoteDescriptor::for_endpoint(&node, self.config.backup_filename.clone());
                match transport.pull(&remote, &archive).await {
                    Ok(()) => info!(remote = %remote.target(), "Pulled backup from node"),
                    Err(e) => warn!(remote = %remote.target(), error = %e, "Backup pull failed"),
                }
            }
        }

        let key = self.root_key.derive_backup_key();
        let restore_dest = dest.clone();
        let restored = tokio::task::spawn_blocking(move || backup::restore(&key, &archive, &restore_dest))
            .await
            .map_err(|e| SupervisorError::Internal(format!("restore task failed: {e}")))?;

        match restored {
            Ok(()) => {
                info!(dir = %dest.display(), "Validator data restored from backup");
                Ok(())
            }
            Err(BackupError::Missing(path)) => {
                warn!(archive = %path.display(), "No backup found, treating as fresh deployment");
                std::fs::create_dir_all(&dest)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::StopValidator { reply } => {
                let _ = reply.send(Ok(self.stop_validator().await));
            }
            SupervisorCommand::StartValidator { reply } => {
                let _ = reply.send(self.start_validator().await);
            }
            SupervisorCommand::SetValidatorRelease { release, reply } => {
                let _ = reply.send(self.set_validator_release(release));
            }
            SupervisorCommand::ConnectTo { host, port, reply } => {
                let _ = reply.send(self.connect_to(host, port).await);
            }
            SupervisorCommand::Backup { reply } => {
                let _ = reply.send(self.backup_now().await);
            }
        }
    }

    //=========================================================================
    // Operations
    //=========================================================================

    /// Stop the validator. Returns true iff a process was running.
    pub async fn stop_validator(&mut self) -> bool {
        self.state.desired_running = false;

        let Some(mut validator) = self.state.validator.take() else {
            if !self.state.lifecycle.is_terminal() && self.state.lifecycle != LifecycleState::Stopped {
                self.transition(LifecycleState::Stopped);
            }
            return false;
        };

        self.transition(LifecycleState::Stopping);
        let was_running = validator.is_alive();
        validator.terminate().await;
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.stop().await;
        }
        self.transition(LifecycleState::Stopped);

        info!(was_running, "Validator stopped");
        was_running
    }

    /// Start the validator. Returns false if it was already running.
    pub async fn start_validator(&mut self) -> Result<bool> {
        if self.state.lifecycle.is_terminal() {
            return Err(SupervisorError::ShuttingDown);
        }
        if let Some(validator) = self.state.validator.as_mut() {
            if validator.is_alive() {
                return Ok(false);
            }
        }
        if let Some(mut dead) = self.state.validator.take() {
            dead.terminate().await;
        }

        self.state.desired_running = true;
        self.transition(LifecycleState::Starting);
        self.launch_with_retry().await?;
        Ok(true)
    }

    /// Replace the release used for the next start. Only while stopped.
    pub fn set_validator_release(&mut self, release: ValidatorRelease) -> Result<()> {
        if self.state.lifecycle != LifecycleState::Stopped {
            return Err(SupervisorError::NotStopped(self.state.lifecycle));
        }
        info!(from = %self.state.release, to = %release, "Validator release changed");
        self.state.release = release;
        self.publish();
        Ok(())
    }

    /// Switch to `host:port`, adding it as a candidate if unknown.
    ///
    /// A running (or wanted) validator is restarted against the new node.
    pub async fn connect_to(&mut self, host: String, port: u16) -> Result<()> {
        if !NodeEndpoint::is_valid_host(&host) || port == 0 {
            return Err(SupervisorError::InvalidRequest(format!(
                "invalid node address {host:?}:{port}"
            )));
        }
        if self.state.lifecycle.is_terminal() {
            return Err(SupervisorError::ShuttingDown);
        }

        let index = match self.state.nodes.iter().position(|n| n.matches(&host, port)) {
            Some(index) => index,
            None => {
                info!(host = %host, port, "Adding node candidate");
                self.state.nodes.push(NodeEndpoint::new(host, port));
                self.state.nodes.len() - 1
            }
        };
        self.switch_node(index).await
    }

    async fn switch_node(&mut self, index: usize) -> Result<()> {
        let restart = self.state.desired_running || self.state.validator.is_some();
        if restart {
            self.stop_validator().await;
        }

        let from = self.active_node().map(ToString::to_string).unwrap_or_default();
        self.state.active = index;
        self.failover.reset();
        info!(from = %from, to = %self.state.nodes[index], "Switched node");
        self.publish();

        if restart {
            self.start_validator().await?;
        }
        Ok(())
    }

    /// Archive the validator directory and push it if configured.
    pub async fn backup_now(&mut self) -> Result<BackupReport> {
        let key = self.root_key.derive_backup_key();
        let source = self.config.validator_data_dir();
        let dest = self.config.backup_path();

        let archive = tokio::task::spawn_blocking(move || backup::create(&key, &source, &dest))
            .await
            .map_err(|e| SupervisorError::Internal(format!("backup task failed: {e}")))??;

        let mut pushed = false;
        if self.config.backup.push_to_node {
            if let (Some(transport), Some(node)) = (self.transport.clone(), self.active_node().cloned()) {
                let remote = RemoteDescriptor::for_endpoint(&node, self.config.backup_filename.clone());
                transport.push(&archive.path, &remote).await?;
                info!(remote = %remote.target(), "Backup pushed to node");
                pushed = true;
            }
        }

        Ok(BackupReport {
            path: archive.path,
            file_count: archive.file_count,
            size_bytes: archive.size_bytes,
            pushed,
        })
    }

    //=========================================================================
    // Internals
    //=========================================================================

    fn active_node(&self) -> Option<&NodeEndpoint> {
        self.state.nodes.get(self.state.active)
    }

    /// Launch attempts until success, exhaustion or shutdown.
    async fn launch_with_retry(&mut self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                return Err(SupervisorError::ShuttingDown);
            }
            attempt += 1;

            match self.launch_once().await {
                Ok(validator) => {
                    info!(
                        attempt,
                        pid = ?validator.pid(),
                        release = %self.state.release,
                        node = ?self.active_node().map(ToString::to_string),
                        "Validator running"
                    );
                    self.state.validator = Some(validator);
                    self.state.last_error = None;
                    self.failover.reset();
                    self.transition(LifecycleState::Running);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Validator launch failed");
                    self.state.last_error = Some(e.to_string());

                    if !self.retry.allows_retry(attempt) {
                        error!(attempts = attempt, "Giving up on validator launch");
                        self.state.desired_running = false;
                        self.transition(LifecycleState::Stopped);
                        return Err(e.into());
                    }

                    self.publish();
                    let delay = self.retry.delay_for(attempt);
                    debug!(?delay, "Retrying validator launch");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_signalled(&mut self.shutdown) => {
                            self.transition(LifecycleState::Stopped);
                            return Err(SupervisorError::ShuttingDown);
                        }
                    }
                }
            }
        }
    }

    async fn launch_once(&mut self) -> std::result::Result<Box<dyn ProcessHandle>, LaunchError> {
        let (start, end) = self.config.port_range;
        let local_port = ports::allocate(start, end)?;
        let data_dir = self.config.validator_data_dir();
        let node = self
            .state
            .nodes
            .get(self.state.active)
            .ok_or_else(|| LaunchError::Artifact("no node configured".to_string()))?;

        let spec = LaunchSpec {
            release: &self.state.release,
            network: &self.config.eth2_network,
            data_dir: &data_dir,
            logs_dir: &self.config.logs_dir,
            node,
            local_port,
            container_name: &self.config.validator.container_name,
        };

        let validator = self.backend.launch(&spec).await?;
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.start(&spec).await;
        }
        Ok(validator)
    }

    /// Periodic liveness and reachability check.
    async fn poll(&mut self) {
        if self.state.lifecycle != LifecycleState::Running || !self.state.desired_running {
            return;
        }

        let alive = self.state.validator.as_mut().is_some_and(|v| v.is_alive());
        if !alive {
            warn!("Validator exited unexpectedly, restarting");
            if let Some(mut dead) = self.state.validator.take() {
                dead.terminate().await;
            }
            self.state.last_error = Some("validator exited unexpectedly".to_string());
            self.transition(LifecycleState::Starting);
            if let Err(e) = self.launch_with_retry().await {
                warn!(error = %e, "Validator restart failed");
            }
            return;
        }

        if !self.failover.enabled() {
            return;
        }
        let (Some(probe), Some(node)) = (self.probe.clone(), self.active_node().cloned()) else {
            return;
        };

        let reachable = probe.is_reachable(&node).await;
        if !self.failover.record(reachable, Instant::now()) {
            return;
        }

        if self.state.nodes.len() < 2 {
            debug!(node = %node, "Node unreachable but no other candidate");
            self.failover.reset();
            return;
        }
        let next = (self.state.active + 1) % self.state.nodes.len();
        warn!(from = %node, to = %self.state.nodes[next], "Node unreachable, failing over");
        if let Err(e) = self.switch_node(next).await {
            warn!(error = %e, "Failover restart failed");
        }
    }

    async fn shut_down(&mut self, server: Option<RunningServer>) {
        self.transition(LifecycleState::ShuttingDown);
        self.state.desired_running = false;

        if let Some(mut validator) = self.state.validator.take() {
            validator.terminate().await;
            info!("Validator terminated");
        }
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.stop().await;
        }
        if let Some(server) = server {
            server.close().await;
        }

        self.transition(LifecycleState::Exited);
        info!("Supervisor exited");
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state.lifecycle;
        if from != to {
            debug!(%from, %to, "Lifecycle transition");
        }
        self.state.lifecycle = to;
        self.publish();
    }

    fn publish(&self) {
        self.health_tx.send_replace(snapshot(&self.state));
    }
}

fn snapshot(state: &SupervisorState) -> Health {
    Health {
        unlocked: state.unlocked,
        validator_running: state.lifecycle == LifecycleState::Running && state.validator.is_some(),
        connected_node: state
            .nodes
            .get(state.active)
            .map(NodeEndpoint::address)
            .unwrap_or_default(),
        validator_release: state.release.clone(),
        state: state.lifecycle,
        pid: state.validator.as_ref().and_then(|v| v.pid()),
        last_error: state.last_error.clone(),
    }
}

/// Resolves once shutdown is requested or the signal source is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
