//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use tempfile::TempDir;

use validator_supervisor::config::{Config, TlsConfig};
use validator_supervisor::keys::{KeyDescriptor, RootKey};
use validator_supervisor::process::{LaunchError, LaunchSpec, ProcessBackend, ProcessHandle};
use validator_supervisor::rpc::{self, AuthKey, RpcClient};
use validator_supervisor::supervisor::{Health, NodeEndpoint};
use validator_supervisor::ValidatorRelease;

pub const PASSWORD: &str = "password123";
pub const NETWORK: &str = "pyrmont";
pub const LIGHTHOUSE_SUM: &str = "a44ecaf9a5f956e9e43928252d6471a2eb6dc59245a5747e4fb545d512522768";

pub fn release(version: &str) -> ValidatorRelease {
    ValidatorRelease::new("lighthouse", version, LIGHTHOUSE_SUM).unwrap()
}

pub fn weak_root_key() -> RootKey {
    let (_descriptor, root) = KeyDescriptor::generate(PASSWORD, "argon2id_weak").unwrap();
    root
}

/// Validator data directory with a keystore and a slashing database
pub fn write_validator_data(dir: &Path) {
    std::fs::create_dir_all(dir.join("validators/0xabc")).unwrap();
    std::fs::write(dir.join("validators/0xabc/voting-keystore.json"), br#"{"crypto":{}}"#).unwrap();
    std::fs::write(dir.join("validators/slashing_protection.sqlite"), vec![7u8; 4096]).unwrap();
    std::fs::write(dir.join("validators/.secrets"), b"hunter2").unwrap();
}

/// Supervisor config with fast timings and two candidate nodes
pub fn test_config(root: &Path) -> Config {
    let data_dir = root.join("data");
    std::fs::create_dir_all(&data_dir).unwrap();

    let mut node = NodeEndpoint::new("localhost", 2222);
    node.user = Some("somebody".to_string());
    let mut alias = NodeEndpoint::new("localhost", 2223);
    alias.user = Some("somebody".to_string());

    let mut config = Config::new(NETWORK, &data_dir, vec![node, alias], release("v1.5.1"));
    config.logs_dir = root.join("logs");
    config.lifecycle.retry_delay_ms = 0;
    config.lifecycle.poll_interval_ms = 20;
    config.lifecycle.failover_enabled = false;
    config.lifecycle.stop_grace_secs = 5;
    config
}

//=============================================================================
// TLS
//=============================================================================

/// CA plus one leaf certificate usable as both server and client
pub struct TestPki {
    pub dir: TempDir,
    pub tls: TlsConfig,
}

pub fn generate_pki() -> TestPki {
    let dir = TempDir::new().unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name.push(DnType::CommonName, "Test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    leaf_params.distinguished_name.push(DnType::CommonName, "localhost");
    leaf_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let ca_file = dir.path().join("ca.pem");
    let cert_file = dir.path().join("cert.pem");
    let key_file = dir.path().join("key.pem");
    std::fs::write(&ca_file, ca_cert.pem()).unwrap();
    std::fs::write(&cert_file, leaf_cert.pem()).unwrap();
    std::fs::write(&key_file, leaf_key.serialize_pem()).unwrap();

    TestPki {
        tls: TlsConfig {
            cert_file,
            key_file,
            ca_file,
            server_name: "localhost".to_string(),
        },
        dir,
    }
}

/// Client for the supervisor's control socket
pub fn rpc_client(socket: PathBuf, tls: &TlsConfig, user: &str, auth_key: &str) -> RpcClient {
    RpcClient::new(
        user,
        AuthKey::from_hex(auth_key).unwrap(),
        socket,
        rpc::tls::client_config(tls).unwrap(),
        rpc::tls::server_name(tls).unwrap(),
    )
    .with_timeout(Duration::from_secs(10))
}

/// Poll `get_health` until `check` holds.
pub async fn wait_for_remote(client: &RpcClient, check: impl Fn(&Health) -> bool) -> Health {
    for _ in 0..100 {
        if let Ok(health) = client.get_health().await {
            if check(&health) {
                return health;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for supervisor health");
}

//=============================================================================
// Fake process backend
//=============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub node: (String, u16),
    pub release: String,
    pub data_dir: PathBuf,
    pub local_port: u16,
}

/// Backend that records launches and hands out in-memory processes
#[derive(Default)]
pub struct FakeBackend {
    launches: Mutex<Vec<Launch>>,
    processes: Mutex<Vec<Arc<AtomicBool>>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    next_pid: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicUsize::new(1000),
            ..Default::default()
        })
    }

    /// Fail the next `n` launch attempts.
    pub fn failing(n: usize) -> Arc<Self> {
        let backend = Self::new();
        backend.failures_left.store(n, Ordering::SeqCst);
        backend
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Simulate the latest process crashing.
    pub fn crash_latest(&self) {
        if let Some(alive) = self.processes.lock().unwrap().last() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn running_count(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait::async_trait]
impl ProcessBackend for FakeBackend {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LaunchError::Spawn {
                program: "fake".to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.launches.lock().unwrap().push(Launch {
            node: spec.node.address(),
            release: spec.release.to_string(),
            data_dir: spec.data_dir.to_path_buf(),
            local_port: spec.local_port,
        });

        let alive = Arc::new(AtomicBool::new(true));
        self.processes.lock().unwrap().push(alive.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(Box::new(FakeProcess { pid, alive }))
    }
}

pub struct FakeProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        self.alive.load(Ordering::SeqCst).then_some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
