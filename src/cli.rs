//! Command-line interface

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use zeroize::Zeroizing;

use validator_supervisor::backup::{self, ScpTransport};
use validator_supervisor::config::{Config, TlsConfig};
use validator_supervisor::keys::KeyDescriptor;
use validator_supervisor::process::{CommandBackend, TelemetryAgent};
use validator_supervisor::rpc::{self, AuthKey, RpcClient};
use validator_supervisor::supervisor::{Supervisor, TcpProbe};
use validator_supervisor::ValidatorRelease;

/// Environment variable holding the operator secret
const SECRET_ENV: &str = "VS_PASSWORD";

#[derive(Parser)]
#[command(name = "validator-supervisor")]
#[command(about = "Unattended supervisor for a blockchain validator client")]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Unlock keys and supervise the validator until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "validator-supervisor.toml")]
        config: PathBuf,
    },

    /// Create a key descriptor from the operator secret
    InitKey {
        /// Where to write the descriptor
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Print a new control channel auth key
    GenUserKey,

    /// Offline backup operations
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Talk to a running supervisor
    Rpc(RpcArgs),
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    /// Seal a validator data directory into an archive
    Create {
        #[arg(long)]
        descriptor: PathBuf,
        #[arg(long)]
        src: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },

    /// Restore an archive into a directory, replacing its contents
    Restore {
        #[arg(long)]
        descriptor: PathBuf,
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct RpcArgs {
    /// Supervisor config to take the socket path and TLS files from
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    socket: Option<PathBuf>,

    #[arg(short, long, default_value = "admin")]
    user: String,

    #[arg(long, env = "VS_AUTH_KEY", hide_env_values = true)]
    auth_key: String,

    /// Client certificate
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA certificate
    #[arg(long)]
    ca: Option<PathBuf>,

    #[arg(long, default_value = "localhost")]
    server_name: String,

    #[command(subcommand)]
    op: RpcOp,
}

#[derive(Debug, Subcommand)]
pub enum RpcOp {
    /// Show supervisor health
    Health,
    /// Stop the validator
    Stop,
    /// Start the validator
    Start,
    /// Change the validator release (validator must be stopped)
    SetRelease {
        #[arg(long = "impl")]
        impl_name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        checksum: String,
    },
    /// Switch to another node
    Connect {
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
    },
    /// Take a backup now
    Backup,
}

pub async fn execute(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run { config } => run(&config).await,
        Command::InitKey { out } => init_key(&out),
        Command::GenUserKey => {
            println!("{}", rpc::gen_user_key());
            Ok(())
        }
        Command::Backup(cmd) => run_backup(cmd),
        Command::Rpc(args) => run_rpc(args).await,
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let descriptor = config.load_key_descriptor()?;
    let secret = read_secret()?;
    let root_key = descriptor.unlock(&secret)?;
    info!("Root key unlocked");

    let backend = Arc::new(CommandBackend::new(config.validator_template(), config.stop_grace()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut supervisor = Supervisor::new(config.clone(), root_key, backend, shutdown_rx)
        .with_probe(Arc::new(TcpProbe::new(config.probe_timeout())));
    if config.backup.push_to_node || config.backup.pull_on_boot {
        supervisor = supervisor.with_transport(Arc::new(ScpTransport::default()));
    }
    if let Some(telemetry) = TelemetryAgent::from_config(&config.telemetry, config.stop_grace()) {
        supervisor = supervisor.with_telemetry(telemetry);
    }

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    supervisor.run().await?;
    Ok(())
}

fn init_key(out: &Path) -> anyhow::Result<()> {
    if out.exists() {
        bail!("{} already exists", out.display());
    }
    let secret = read_secret()?;
    let (descriptor, _root) = KeyDescriptor::generate(&secret, "argon2id")?;
    descriptor.save(out)?;
    println!("Key descriptor written to {}", out.display());
    Ok(())
}

fn run_backup(command: BackupCommand) -> anyhow::Result<()> {
    match command {
        BackupCommand::Create { descriptor, src, dest } => {
            let key = unlock_descriptor(&descriptor)?.derive_backup_key();
            let archive = backup::create(&key, &src, &dest)?;
            println!(
                "Wrote {} ({} files, {} bytes)",
                archive.path.display(),
                archive.file_count,
                archive.size_bytes
            );
        }
        BackupCommand::Restore { descriptor, archive, dest } => {
            let key = unlock_descriptor(&descriptor)?.derive_backup_key();
            backup::restore(&key, &archive, &dest)?;
            println!("Restored {} into {}", archive.display(), dest.display());
        }
    }
    Ok(())
}

fn unlock_descriptor(path: &Path) -> anyhow::Result<validator_supervisor::RootKey> {
    let descriptor = KeyDescriptor::load(path)
        .with_context(|| format!("loading key descriptor {}", path.display()))?;
    let secret = read_secret()?;
    Ok(descriptor.unlock(&secret)?)
}

async fn run_rpc(args: RpcArgs) -> anyhow::Result<()> {
    let config = args.config.as_deref().map(Config::load).transpose()?;

    let socket = match (&args.socket, &config) {
        (Some(socket), _) => socket.clone(),
        (None, Some(config)) => config.rpc_socket_path(),
        (None, None) => bail!("--socket or --config is required"),
    };
    let tls = match (&args.cert, &args.key, &args.ca) {
        (Some(cert), Some(key), Some(ca)) => TlsConfig {
            cert_file: cert.clone(),
            key_file: key.clone(),
            ca_file: ca.clone(),
            server_name: args.server_name.clone(),
        },
        _ => config
            .as_ref()
            .and_then(|c| c.tls.clone())
            .context("--cert, --key and --ca (or a config with [tls]) are required")?,
    };

    let client = RpcClient::new(
        args.user,
        AuthKey::from_hex(&args.auth_key)?,
        socket,
        rpc::tls::client_config(&tls)?,
        rpc::tls::server_name(&tls)?,
    );

    let output = match args.op {
        RpcOp::Health => serde_json::to_string_pretty(&client.get_health().await?)?,
        RpcOp::Stop => format!("was running: {}", client.stop_validator().await?),
        RpcOp::Start => format!("started: {}", client.start_validator().await?),
        RpcOp::SetRelease { impl_name, version, checksum } => {
            let release = ValidatorRelease::new(impl_name, version, checksum)?;
            client.set_validator_release(release.clone()).await?;
            format!("release set to {release}")
        }
        RpcOp::Connect { host, port } => {
            client.connect_eth2_node(host.clone(), port).await?;
            format!("connected to {host}:{port}")
        }
        RpcOp::Backup => serde_json::to_string_pretty(&client.backup().await?)?,
    };
    println!("{output}");
    Ok(())
}

/// Operator secret from the environment, else the first line of stdin.
fn read_secret() -> anyhow::Result<Zeroizing<String>> {
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        return Ok(Zeroizing::new(secret));
    }
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading secret from stdin")?;
    let secret = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if secret.is_empty() {
        bail!("no secret provided (set {SECRET_ENV} or pipe it on stdin)");
    }
    Ok(secret)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
