//! Supervisor configuration

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::keys::{crypto, KeyDescriptor, KeyError};
use crate::process::CommandTemplate;
use crate::release::ValidatorRelease;
use crate::supervisor::failover::FailoverPolicy;
use crate::supervisor::models::NodeEndpoint;
use crate::supervisor::retry::RetryPolicy;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Key descriptor uses KDF parameters below production strength ({0})")]
    WeakKdf(String),

    #[error("Key descriptor error: {0}")]
    Key(#[from] KeyError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Eth2 network the validator runs on
    pub eth2_network: String,

    /// Root of supervisor state; the validator directory and backup live here
    pub data_dir: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    #[serde(default = "default_backup_filename")]
    pub backup_filename: String,

    /// Persisted key descriptor, defaults to `data_dir/key.json`
    #[serde(default)]
    pub key_descriptor_file: Option<PathBuf>,

    /// Ports available to the validator's ancillary listeners
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    /// Candidate upstream nodes, first one is active at boot
    pub nodes: Vec<NodeEndpoint>,

    pub validator: ValidatorConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub backup: BackupConfig,
}

/// Validator client launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub release: ValidatorRelease,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    #[serde(default = "default_validator_program")]
    pub program: String,

    /// Arguments with `{placeholder}` substitution
    #[serde(default = "default_validator_args")]
    pub args: Vec<String>,

    /// Binary to checksum before launch (templated). Without it the args
    /// must pin the image digest through `{checksum}`.
    #[serde(default)]
    pub artifact: Option<String>,
}

/// Control channel settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Socket path, defaults to `data_dir/supervisor.sock`
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// User name to hex auth key
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

/// Mutual TLS material for the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// CA that signs both server and client certificates
    pub ca_file: PathBuf,
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// 0 retries forever
    #[serde(default)]
    pub max_launch_attempts: u32,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_true")]
    pub failover_enabled: bool,

    #[serde(default = "default_failover_threshold")]
    pub failover_threshold_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay(),
            max_launch_attempts: 0,
            backoff_factor: default_backoff_factor(),
            max_retry_delay_ms: default_max_retry_delay(),
            poll_interval_ms: default_poll_interval(),
            failover_enabled: true,
            failover_threshold_secs: default_failover_threshold(),
            probe_timeout_ms: default_probe_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

/// Log shipping sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_telemetry_program")]
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_telemetry_program(),
            args: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Seconds between periodic backups, 0 disables them
    #[serde(default)]
    pub interval_secs: u64,

    /// Copy each new archive to the active node
    #[serde(default)]
    pub push_to_node: bool,

    /// Fetch the archive from the active node when none exists locally
    #[serde(default)]
    pub pull_on_boot: bool,
}

// Defaults
fn default_logs_dir() -> PathBuf { PathBuf::from("/var/log/validator-supervisor") }
fn default_backup_filename() -> String { "supervisor-backup.bin".to_string() }
fn default_port_range() -> (u16, u16) { (13000, 14000) }
fn default_container_name() -> String { "validator-supervisor_validator".to_string() }
fn default_validator_program() -> String { "docker".to_string() }
fn default_validator_args() -> Vec<String> {
    ["run", "--rm", "--name", "{container}", "--network", "host",
     "--volume", "{data_dir}:/data", "{impl}@sha256:{checksum}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_server_name() -> String { "localhost".to_string() }
fn default_retry_delay() -> u64 { 5000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_max_retry_delay() -> u64 { 60_000 }
fn default_poll_interval() -> u64 { 1000 }
fn default_true() -> bool { true }
fn default_failover_threshold() -> u64 { 60 }
fn default_probe_timeout() -> u64 { 2000 }
fn default_stop_grace() -> u64 { 10 }
fn default_telemetry_program() -> String { "promtail".to_string() }

impl Config {
    /// Minimal configuration with defaults for everything optional.
    pub fn new(
        eth2_network: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        nodes: Vec<NodeEndpoint>,
        release: ValidatorRelease,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            eth2_network: eth2_network.into(),
            logs_dir: data_dir.join("logs"),
            data_dir,
            backup_filename: default_backup_filename(),
            key_descriptor_file: None,
            port_range: default_port_range(),
            nodes,
            validator: ValidatorConfig {
                release,
                container_name: default_container_name(),
                program: default_validator_program(),
                args: default_validator_args(),
                artifact: None,
            },
            rpc: RpcConfig::default(),
            tls: None,
            lifecycle: LifecycleConfig::default(),
            telemetry: TelemetryConfig::default(),
            backup: BackupConfig::default(),
        }
    }

    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents)?;
        info!(path = %path.display(), nodes = config.nodes.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("at least one node is required".to_string()));
        }
        let malformed = |n: &&NodeEndpoint| !NodeEndpoint::is_valid_host(&n.host) || n.port == 0;
        if let Some(node) = self.nodes.iter().find(malformed) {
            return Err(ConfigError::Invalid(format!("invalid node endpoint {node}")));
        }
        if self.port_range.0 > self.port_range.1 {
            return Err(ConfigError::Invalid(format!(
                "port_range start {} exceeds end {}",
                self.port_range.0, self.port_range.1
            )));
        }
        let mut components = Path::new(&self.backup_filename).components();
        let bare = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !bare {
            return Err(ConfigError::Invalid(format!(
                "backup_filename {:?} must be a bare file name",
                self.backup_filename
            )));
        }
        let pinned = self.validator.artifact.is_some()
            || self.validator.args.iter().any(|arg| arg.contains("{checksum}"));
        if !pinned {
            return Err(ConfigError::Invalid(
                "validator release is not pinned: set validator.artifact or use {checksum} in validator.args"
                    .to_string(),
            ));
        }
        for (user, key) in &self.rpc.users {
            if user.is_empty() || user.contains('\0') {
                return Err(ConfigError::Invalid(format!("invalid rpc user name {user:?}")));
            }
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid(format!(
                    "auth key for rpc user {user:?} must be 64 hex digits"
                )));
            }
        }
        if self.lifecycle.backoff_factor < 1.0 || !self.lifecycle.backoff_factor.is_finite() {
            return Err(ConfigError::Invalid("backoff_factor must be >= 1".to_string()));
        }
        if self.lifecycle.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn key_descriptor_path(&self) -> PathBuf {
        self.key_descriptor_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("key.json"))
    }

    /// Load the persisted key descriptor for a production run.
    ///
    /// Descriptors generated with the test-only profile are refused here.
    pub fn load_key_descriptor(&self) -> Result<KeyDescriptor, ConfigError> {
        let descriptor = KeyDescriptor::load(&self.key_descriptor_path())?;
        if !descriptor.params.within_limits() {
            return Err(ConfigError::Invalid(format!(
                "key descriptor KDF parameters out of range: {:?}",
                descriptor.params
            )));
        }
        if descriptor.algorithm.is_weak()
            || descriptor.params.memory_kib < crypto::ARGON2_MEMORY_KB
            || descriptor.params.iterations < crypto::ARGON2_ITERATIONS
        {
            return Err(ConfigError::WeakKdf(descriptor.algorithm.name().to_string()));
        }
        Ok(descriptor)
    }

    /// Where the encrypted backup lives
    pub fn backup_path(&self) -> PathBuf {
        self.data_dir.join(&self.backup_filename)
    }

    /// Directory restored from backup and handed to the validator
    pub fn validator_data_dir(&self) -> PathBuf {
        self.data_dir.join("validator")
    }

    pub fn rpc_socket_path(&self) -> PathBuf {
        self.rpc
            .socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("supervisor.sock"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let lifecycle = &self.lifecycle;
        RetryPolicy {
            delay: Duration::from_millis(lifecycle.retry_delay_ms),
            max_attempts: (lifecycle.max_launch_attempts > 0).then_some(lifecycle.max_launch_attempts),
            backoff_factor: lifecycle.backoff_factor,
            max_delay: Duration::from_millis(lifecycle.max_retry_delay_ms),
        }
    }

    pub fn failover_policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            enabled: self.lifecycle.failover_enabled,
            threshold: Duration::from_secs(self.lifecycle.failover_threshold_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lifecycle.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.lifecycle.stop_grace_secs)
    }

    pub fn backup_interval(&self) -> Option<Duration> {
        (self.backup.interval_secs > 0).then(|| Duration::from_secs(self.backup.interval_secs))
    }

    pub fn validator_template(&self) -> CommandTemplate {
        let template = CommandTemplate::new(
            self.validator.program.clone(),
            self.validator.args.clone(),
            "validator",
        );
        match &self.validator.artifact {
            Some(artifact) => template.with_artifact(artifact.clone()),
            None => template,
        }
    }
}
