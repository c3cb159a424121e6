//! Supervisor lifecycle integration tests
//!
//! Runs a real supervisor loop against an in-memory process backend. The
//! control channel tests go through the full TLS socket path.

mod common;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::{
    generate_pki, release, rpc_client, test_config, wait_for_remote, weak_root_key,
    write_validator_data, FakeBackend, PASSWORD,
};
use validator_supervisor::backup::{self, BackupError, BackupTransport, RemoteDescriptor, TransportError};
use validator_supervisor::keys::KeyDescriptor;
use validator_supervisor::process::CommandBackend;
use validator_supervisor::rpc::{self, RpcError};
use validator_supervisor::supervisor::{NodeProbe, NodeEndpoint};
use validator_supervisor::{Config, Health, LifecycleState, RootKey, Supervisor, SupervisorError, SupervisorHandle};

const WAIT: Duration = Duration::from_secs(10);

struct Running {
    task: JoinHandle<(Supervisor, validator_supervisor::Result<()>)>,
    handle: SupervisorHandle,
    shutdown: watch::Sender<bool>,
}

impl Running {
    async fn wait_for(&self, predicate: impl FnMut(&Health) -> bool) -> Health {
        tokio::time::timeout(WAIT, self.handle.wait_for_health(predicate))
            .await
            .expect("timed out waiting for health")
            .unwrap()
    }

    async fn shut_down(self) -> (Supervisor, validator_supervisor::Result<()>) {
        self.shutdown.send_replace(true);
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("supervisor did not exit")
            .unwrap()
    }
}

fn spawn_supervisor(mut supervisor: Supervisor, shutdown: watch::Sender<bool>) -> Running {
    let handle = supervisor.handle();
    let task = tokio::spawn(async move {
        let result = supervisor.run().await;
        (supervisor, result)
    });
    Running {
        task,
        handle,
        shutdown,
    }
}

fn start(config: Config, root: RootKey, backend: Arc<FakeBackend>) -> Running {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(config, root, backend, shutdown_rx);
    spawn_supervisor(supervisor, shutdown_tx)
}

/// Seed an encrypted backup the supervisor can restore at boot.
fn seed_backup(root: &Path, config: &Config, key: &RootKey) {
    let src = root.join("seed");
    write_validator_data(&src);
    backup::create(&key.derive_backup_key(), &src, &config.backup_path()).unwrap();
}

fn unlocked_pair() -> (RootKey, RootKey) {
    let (descriptor, root) = KeyDescriptor::generate(PASSWORD, "argon2id_weak").unwrap();
    (root, descriptor.unlock(PASSWORD).unwrap())
}

//=============================================================================
// Fakes
//=============================================================================

/// Probe that reports a fixed set of ports as down
#[derive(Default)]
struct FakeProbe {
    down: Mutex<HashSet<u16>>,
}

impl FakeProbe {
    fn with_down(port: u16) -> Arc<Self> {
        let probe = Self::default();
        probe.down.lock().unwrap().insert(port);
        Arc::new(probe)
    }
}

#[async_trait::async_trait]
impl NodeProbe for FakeProbe {
    async fn is_reachable(&self, endpoint: &NodeEndpoint) -> bool {
        !self.down.lock().unwrap().contains(&endpoint.port)
    }
}

/// Transport backed by a local directory
struct DirTransport {
    root: PathBuf,
    pushes: Mutex<Vec<String>>,
}

impl DirTransport {
    fn new(root: PathBuf) -> Arc<Self> {
        std::fs::create_dir_all(&root).unwrap();
        Arc::new(Self {
            root,
            pushes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl BackupTransport for DirTransport {
    async fn push(&self, local_path: &Path, remote: &RemoteDescriptor) -> Result<(), TransportError> {
        std::fs::copy(local_path, self.root.join(&remote.path)).map_err(|e| TransportError::Failed {
            status: "copy".to_string(),
            stderr: e.to_string(),
        })?;
        self.pushes.lock().unwrap().push(remote.target());
        Ok(())
    }

    async fn pull(&self, remote: &RemoteDescriptor, local_path: &Path) -> Result<(), TransportError> {
        std::fs::copy(self.root.join(&remote.path), local_path).map_err(|e| TransportError::Failed {
            status: "copy".to_string(),
            stderr: e.to_string(),
        })?;
        Ok(())
    }
}

//=============================================================================
// Control channel scenarios
//=============================================================================

#[tokio::test]
async fn test_remote_control_lifecycle() {
    let dir = TempDir::new().unwrap();
    let pki = generate_pki();
    let auth_key = rpc::gen_user_key();

    let mut config = test_config(dir.path());
    config.tls = Some(pki.tls.clone());
    config.rpc.users.insert("admin".to_string(), auth_key.clone());

    let (root, unlocked) = unlocked_pair();
    seed_backup(dir.path(), &config, &root);

    let backend = FakeBackend::new();
    let socket = config.rpc_socket_path();
    let data_dir = config.validator_data_dir();
    let running = start(config, unlocked, backend.clone());
    let client = rpc_client(socket.clone(), &pki.tls, "admin", &auth_key);

    // Cold start: restored data, validator against the first node
    let health = wait_for_remote(&client, |h| h.validator_running).await;
    assert!(health.unlocked);
    assert_eq!(health.state, LifecycleState::Running);
    assert_eq!(health.connected_node, ("localhost".to_string(), 2222));
    assert_eq!(health.validator_release, release("v1.5.1"));
    assert!(data_dir.join("validators/0xabc/voting-keystore.json").exists());
    assert_eq!(backend.launches()[0].data_dir, data_dir);

    // Stop reports liveness, twice
    assert!(client.stop_validator().await.unwrap());
    assert!(!client.stop_validator().await.unwrap());
    let health = client.get_health().await.unwrap();
    assert!(!health.validator_running);
    assert_eq!(health.state, LifecycleState::Stopped);
    assert_eq!(backend.running_count(), 0);

    // Release swap while stopped is picked up by the next start
    client.set_validator_release(release("v1.5.2")).await.unwrap();
    assert_eq!(client.get_health().await.unwrap().validator_release, release("v1.5.2"));
    assert!(client.start_validator().await.unwrap());
    assert!(!client.start_validator().await.unwrap());
    assert_eq!(backend.launches().last().unwrap().release, "lighthouse@v1.5.2");

    // Release swap while running is refused
    let refused = client.set_validator_release(release("v1.5.3")).await;
    assert!(matches!(refused, Err(RpcError::Remote(_))));
    assert_eq!(client.get_health().await.unwrap().validator_release, release("v1.5.2"));

    // Switching nodes restarts the validator against the new endpoint
    client.connect_eth2_node("localhost", 2223).await.unwrap();
    let health = client.get_health().await.unwrap();
    assert_eq!(health.connected_node, ("localhost".to_string(), 2223));
    assert!(health.validator_running);
    assert_eq!(backend.launches().last().unwrap().node, ("localhost".to_string(), 2223));
    assert_eq!(backend.running_count(), 1);

    let bad = client.connect_eth2_node("", 2223).await;
    assert!(matches!(bad, Err(RpcError::InvalidRequest(_))));

    // Shutdown closes the socket and stops the validator
    let (supervisor, result) = running.shut_down().await;
    result.unwrap();
    assert!(supervisor.validator_handle().is_none());
    assert_eq!(supervisor.health().state, LifecycleState::Exited);
    assert_eq!(backend.running_count(), 0);
    assert!(!socket.exists());

    let refused = client.get_health().await;
    assert!(matches!(refused, Err(RpcError::ConnectionRefused(p)) if p == socket));
}

#[tokio::test]
async fn test_unauthenticated_requests_are_rejected() {
    let dir = TempDir::new().unwrap();
    let pki = generate_pki();
    let auth_key = rpc::gen_user_key();

    let mut config = test_config(dir.path());
    config.tls = Some(pki.tls.clone());
    config.rpc.users.insert("admin".to_string(), auth_key.clone());
    let socket = config.rpc_socket_path();

    let backend = FakeBackend::new();
    let running = start(config, weak_root_key(), backend.clone());
    running.wait_for(|h| h.validator_running).await;

    let good = rpc_client(socket.clone(), &pki.tls, "admin", &auth_key);
    wait_for_remote(&good, |h| h.validator_running).await;

    let wrong_key = rpc_client(socket.clone(), &pki.tls, "admin", &rpc::gen_user_key());
    assert!(matches!(wrong_key.stop_validator().await, Err(RpcError::Unauthorized)));

    let unknown_user = rpc_client(socket.clone(), &pki.tls, "mallory", &auth_key);
    assert!(matches!(unknown_user.get_health().await, Err(RpcError::Unauthorized)));

    // Nothing was executed on their behalf
    assert!(good.get_health().await.unwrap().validator_running);
    assert_eq!(backend.launches().len(), 1);

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = TempDir::new().unwrap();
    let pki = generate_pki();
    let auth_key = rpc::gen_user_key();

    let mut config = test_config(dir.path());
    config.tls = Some(pki.tls.clone());
    config.rpc.users.insert("admin".to_string(), auth_key.clone());
    let socket = config.rpc_socket_path();

    // Left behind by a crashed run
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let running = start(config, weak_root_key(), FakeBackend::new());
    let client = rpc_client(socket, &pki.tls, "admin", &auth_key);
    wait_for_remote(&client, |h| h.validator_running).await;

    running.shut_down().await.1.unwrap();
}

//=============================================================================
// Lifecycle scenarios
//=============================================================================

#[tokio::test]
async fn test_fresh_deployment_without_backup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let data_dir = config.validator_data_dir();

    let backend = FakeBackend::new();
    let running = start(config, weak_root_key(), backend.clone());

    let health = running.wait_for(|h| h.validator_running).await;
    assert_eq!(health.pid, Some(1000));
    assert!(data_dir.is_dir());

    let (supervisor, result) = running.shut_down().await;
    result.unwrap();
    assert!(supervisor.validator_handle().is_none());
}

#[tokio::test]
async fn test_crashed_validator_is_restarted() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let running = start(test_config(dir.path()), weak_root_key(), backend.clone());

    let first = running.wait_for(|h| h.validator_running).await.pid;
    backend.crash_latest();

    let health = running
        .wait_for(|h| h.validator_running && h.pid.is_some() && h.pid != first)
        .await;
    assert_eq!(health.state, LifecycleState::Running);
    assert_eq!(backend.launches().len(), 2);
    assert_eq!(backend.running_count(), 1);

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_stopped_validator_is_not_restarted() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let running = start(test_config(dir.path()), weak_root_key(), backend.clone());
    running.wait_for(|h| h.validator_running).await;

    assert!(running.handle.stop_validator().await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(backend.launches().len(), 1);
    assert_eq!(running.handle.health().state, LifecycleState::Stopped);

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_launch_retries_until_exhausted() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.lifecycle.max_launch_attempts = 3;

    let backend = FakeBackend::failing(10);
    let running = start(config, weak_root_key(), backend.clone());

    let health = running
        .wait_for(|h| h.state == LifecycleState::Stopped && h.last_error.is_some())
        .await;
    assert!(!health.validator_running);
    assert!(health.last_error.unwrap().contains("injected failure"));
    assert_eq!(backend.attempts(), 3);

    // A later start gets a fresh budget
    let result = running.handle.start_validator().await;
    assert!(matches!(result, Err(SupervisorError::Launch(_))));
    assert_eq!(backend.attempts(), 6);

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_launch_recovers_after_transient_failures() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.lifecycle.max_launch_attempts = 5;

    let backend = FakeBackend::failing(2);
    let running = start(config, weak_root_key(), backend.clone());

    let health = running.wait_for(|h| h.validator_running).await;
    assert!(health.last_error.is_none());
    assert_eq!(backend.attempts(), 3);

    running.shut_down().await.1.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_mismatched_artifact_is_never_launched() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    std::fs::write(dir.path().join("lighthouse-v1.5.1"), b"not the released binary").unwrap();
    config.validator.program = "sleep".to_string();
    config.validator.args = vec!["30".to_string()];
    config.validator.artifact = Some(format!("{}/{{impl}}-{{version}}", dir.path().display()));
    config.lifecycle.max_launch_attempts = 2;

    let logs_dir = config.logs_dir.clone();
    let backend = Arc::new(CommandBackend::new(config.validator_template(), config.stop_grace()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(config, weak_root_key(), backend, shutdown_rx);
    let running = spawn_supervisor(supervisor, shutdown_tx);

    let health = running
        .wait_for(|h| h.state == LifecycleState::Stopped && h.last_error.is_some())
        .await;
    assert!(!health.validator_running);
    assert!(health.pid.is_none());
    assert!(health.last_error.unwrap().contains("Checksum mismatch"));
    // Nothing was spawned, so no log file was opened
    assert!(!logs_dir.join("validator.log").exists());

    let result = running.handle.start_validator().await;
    assert!(matches!(result, Err(SupervisorError::Launch(_))));
    assert!(running.handle.health().pid.is_none());

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_retry_wait() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.lifecycle.retry_delay_ms = 60_000;

    let backend = FakeBackend::failing(usize::MAX);
    let running = start(config, weak_root_key(), backend.clone());
    running.wait_for(|h| h.last_error.is_some()).await;

    let (supervisor, result) = running.shut_down().await;
    result.unwrap();
    assert_eq!(backend.attempts(), 1);
    assert_eq!(supervisor.health().state, LifecycleState::Exited);
}

#[tokio::test]
async fn test_set_release_requires_stopped() {
    let dir = TempDir::new().unwrap();
    let running = start(test_config(dir.path()), weak_root_key(), FakeBackend::new());
    running.wait_for(|h| h.validator_running).await;

    let result = running.handle.set_validator_release(release("v1.5.2")).await;
    assert!(matches!(
        result,
        Err(SupervisorError::NotStopped(LifecycleState::Running))
    ));

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_connect_to_while_stopped_only_switches() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let running = start(test_config(dir.path()), weak_root_key(), backend.clone());
    running.wait_for(|h| h.validator_running).await;

    running.handle.stop_validator().await.unwrap();
    running.handle.connect_to("beacon.internal", 5052).await.unwrap();

    let health = running.handle.health();
    assert_eq!(health.connected_node, ("beacon.internal".to_string(), 5052));
    assert_eq!(health.state, LifecycleState::Stopped);
    assert_eq!(backend.launches().len(), 1);

    // The next start uses the new candidate
    assert!(running.handle.start_validator().await.unwrap());
    assert_eq!(
        backend.launches().last().unwrap().node,
        ("beacon.internal".to_string(), 5052)
    );

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_connect_to_rejects_malformed_host() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let running = start(test_config(dir.path()), weak_root_key(), backend.clone());
    running.wait_for(|h| h.validator_running).await;

    for host in ["{x}", "{version}", "", "beacon node", "host/path"] {
        let result = running.handle.connect_to(host, 2223).await;
        assert!(
            matches!(result, Err(SupervisorError::InvalidRequest(_))),
            "{host:?} was accepted"
        );
    }

    // The running validator was left alone
    let health = running.handle.health();
    assert!(health.validator_running);
    assert_eq!(health.connected_node, ("localhost".to_string(), 2222));
    assert_eq!(backend.launches().len(), 1);

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_unreachable_node_fails_over() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.lifecycle.failover_enabled = true;
    config.lifecycle.failover_threshold_secs = 0;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let backend = FakeBackend::new();
    let supervisor = Supervisor::new(config, weak_root_key(), backend.clone(), shutdown_rx)
        .with_probe(FakeProbe::with_down(2222));
    let running = spawn_supervisor(supervisor, shutdown_tx);

    let health = running
        .wait_for(|h| h.validator_running && h.connected_node.1 == 2223)
        .await;
    assert_eq!(health.connected_node.0, "localhost");

    let launches = backend.launches();
    assert_eq!(launches.first().unwrap().node.1, 2222);
    assert_eq!(launches.last().unwrap().node.1, 2223);
    assert_eq!(backend.running_count(), 1);

    running.shut_down().await.1.unwrap();
}

//=============================================================================
// Backup scenarios
//=============================================================================

#[tokio::test]
async fn test_corrupt_backup_aborts_startup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    std::fs::write(config.backup_path(), b"definitely not an archive").unwrap();

    let backend = FakeBackend::new();
    let (supervisor, result) = start(config, weak_root_key(), backend.clone()).shut_down().await;

    assert!(matches!(
        result,
        Err(SupervisorError::Backup(BackupError::CorruptArchive(_)))
    ));
    assert_eq!(supervisor.health().state, LifecycleState::Exited);
    assert!(supervisor.health().last_error.is_some());
    assert_eq!(backend.attempts(), 0);
}

#[tokio::test]
async fn test_backup_under_other_key_aborts_startup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    seed_backup(dir.path(), &config, &weak_root_key());

    let backend = FakeBackend::new();
    let running = start(config, weak_root_key(), backend.clone());
    let health = running.wait_for(|h| h.state == LifecycleState::Exited).await;
    assert!(!health.validator_running);

    let (_, result) = running.shut_down().await;
    assert!(matches!(result, Err(SupervisorError::Backup(BackupError::WrongKey))));
    assert_eq!(backend.attempts(), 0);
}

#[tokio::test]
async fn test_backup_command_seals_and_pushes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.backup.push_to_node = true;
    let backup_path = config.backup_path();

    let (root, unlocked) = unlocked_pair();
    write_validator_data(&config.validator_data_dir());

    let transport = DirTransport::new(dir.path().join("remote"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(config, unlocked, FakeBackend::new(), shutdown_rx)
        .with_transport(transport.clone());
    let running = spawn_supervisor(supervisor, shutdown_tx);
    running.wait_for(|h| h.validator_running).await;

    let report = running.handle.backup().await.unwrap();
    assert_eq!(report.path, backup_path);
    assert_eq!(report.file_count, 3);
    assert!(report.pushed);
    assert_eq!(
        *transport.pushes.lock().unwrap(),
        vec!["somebody@localhost:supervisor-backup.bin".to_string()]
    );

    // The sealed archive restores under the same root key
    let out = dir.path().join("check");
    backup::restore(&root.derive_backup_key(), &backup_path, &out).unwrap();
    assert!(out.join("validators/slashing_protection.sqlite").exists());

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_fresh_host_pulls_backup_on_boot() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.backup.pull_on_boot = true;
    let data_dir = config.validator_data_dir();

    let (root, unlocked) = unlocked_pair();
    let transport = DirTransport::new(dir.path().join("remote"));
    let src = dir.path().join("seed");
    write_validator_data(&src);
    backup::create(
        &root.derive_backup_key(),
        &src,
        &transport.root.join(&config.backup_filename),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(config, unlocked, FakeBackend::new(), shutdown_rx)
        .with_transport(transport);
    let running = spawn_supervisor(supervisor, shutdown_tx);

    running.wait_for(|h| h.validator_running).await;
    assert!(data_dir.join("validators/.secrets").exists());

    running.shut_down().await.1.unwrap();
}

#[tokio::test]
async fn test_run_twice_is_refused() {
    let dir = TempDir::new().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(test_config(dir.path()), weak_root_key(), FakeBackend::new(), shutdown_rx);
    let (mut supervisor, result) = spawn_supervisor(supervisor, shutdown_tx).shut_down().await;
    result.unwrap();

    assert!(matches!(supervisor.run().await, Err(SupervisorError::AlreadyRunning)));
}
