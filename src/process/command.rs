//! Command backend - runs the validator as a child process
//!
//! The command line is a template. Placeholders are substituted from the
//! [`LaunchSpec`]:
//!
//! | placeholder       | value                                  |
//! |-------------------|----------------------------------------|
//! | `{impl}`          | release implementation name            |
//! | `{version}`       | release version                        |
//! | `{checksum}`      | release SHA-256                        |
//! | `{network}`       | eth2 network name                      |
//! | `{data_dir}`      | validator data directory               |
//! | `{logs_dir}`      | log directory                          |
//! | `{node_host}`     | active node host                       |
//! | `{node_port}`     | active node port                       |
//! | `{node_user}`     | active node SSH user (may be empty)    |
//! | `{node_identity}` | active node SSH identity (may be empty)|
//! | `{local_port}`    | port reserved from the port range      |
//! | `{container}`     | container name                         |
//!
//! When an `artifact` template is set, the rendered file is hashed and must
//! match the release checksum before anything is spawned.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{LaunchError, LaunchSpec, ProcessBackend, ProcessHandle};
use crate::release::ReleaseError;

/// Command line with `{placeholder}` substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Path of the binary to verify against the release checksum
    pub artifact: Option<String>,
    /// Base name of the log file under the logs directory
    pub log_name: String,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>, log_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            artifact: None,
            log_name: log_name.into(),
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Substitute every placeholder in `input` in a single pass.
    ///
    /// Substituted values are never rescanned. Braces around anything other
    /// than an identifier are copied through.
    pub fn render(input: &str, spec: &LaunchSpec<'_>) -> Result<String, LaunchError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let Some(end) = tail.find('}') else {
                out.push_str(tail);
                return Ok(out);
            };
            let name = &tail[1..end];

            if !is_identifier(name) {
                // Keep the brace, resume scanning just after it
                out.push('{');
                rest = &tail[1..];
                continue;
            }
            match placeholder_value(name, spec) {
                Some(value) => out.push_str(&value),
                None => {
                    return Err(LaunchError::Template(format!(
                        "unknown placeholder {{{name}}} in {input:?}"
                    )))
                }
            }
            rest = &tail[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn render_args(&self, spec: &LaunchSpec<'_>) -> Result<Vec<String>, LaunchError> {
        self.args.iter().map(|arg| Self::render(arg, spec)).collect()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn placeholder_value(name: &str, spec: &LaunchSpec<'_>) -> Option<String> {
    let value = match name {
        "impl" => spec.release.impl_name().to_string(),
        "version" => spec.release.version().to_string(),
        "checksum" => spec.release.checksum().to_string(),
        "network" => spec.network.to_string(),
        "data_dir" => spec.data_dir.display().to_string(),
        "logs_dir" => spec.logs_dir.display().to_string(),
        "node_host" => spec.node.host.clone(),
        "node_port" => spec.node.port.to_string(),
        "node_user" => spec.node.user.clone().unwrap_or_default(),
        "node_identity" => spec
            .node
            .identity_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "local_port" => spec.local_port.to_string(),
        "container" => spec.container_name.to_string(),
        _ => return None,
    };
    Some(value)
}

/// Spawns processes from a [`CommandTemplate`]
#[derive(Debug, Clone)]
pub struct CommandBackend {
    template: CommandTemplate,
    stop_grace: Duration,
}

impl CommandBackend {
    pub fn new(template: CommandTemplate, stop_grace: Duration) -> Self {
        Self {
            template,
            stop_grace,
        }
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    fn verify_artifact(&self, spec: &LaunchSpec<'_>) -> Result<(), LaunchError> {
        let Some(artifact) = &self.template.artifact else {
            return Ok(());
        };
        let path = PathBuf::from(CommandTemplate::render(artifact, spec)?);

        match spec.release.verify_artifact(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Release artifact checksum verified");
                Ok(())
            }
            Err(e @ ReleaseError::ChecksumMismatch { .. }) => {
                Err(LaunchError::ChecksumMismatch(e.to_string()))
            }
            Err(e) => Err(LaunchError::Artifact(format!("{}: {e}", path.display()))),
        }
    }

    /// Spawn the rendered command with output appended to its log file.
    pub fn spawn(&self, spec: &LaunchSpec<'_>) -> Result<ChildProcess, LaunchError> {
        self.verify_artifact(spec)?;
        let args = self.template.render_args(spec)?;

        let spawn_err = |reason: String| LaunchError::Spawn {
            program: self.template.program.clone(),
            reason,
        };

        std::fs::create_dir_all(spec.logs_dir).map_err(|e| spawn_err(e.to_string()))?;
        let log_path = spec.logs_dir.join(format!("{}.log", self.template.log_name));
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| spawn_err(format!("{}: {e}", log_path.display())))?;
        let stderr = stdout.try_clone().map_err(|e| spawn_err(e.to_string()))?;

        let child = Command::new(&self.template.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let process = ChildProcess::new(child, self.template.log_name.clone(), self.stop_grace);
        info!(
            program = %self.template.program,
            pid = ?process.pid(),
            node = %spec.node,
            release = %spec.release,
            "Process launched"
        );
        Ok(process)
    }
}

#[async_trait::async_trait]
impl ProcessBackend for CommandBackend {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        Ok(Box::new(self.spawn(spec)?))
    }
}

/// Handle to a spawned child process
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    label: String,
    stop_grace: Duration,
}

impl ChildProcess {
    pub fn new(child: Child, label: String, stop_grace: Duration) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            label,
            stop_grace,
        }
    }

    #[cfg(unix)]
    fn request_stop(&self, pid: u32) {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            debug!(label = %self.label, pid, "SIGTERM delivery failed");
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self, _pid: u32) {}
}

#[async_trait::async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        if self.pid.is_none() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(label = %self.label, pid = ?self.pid, %status, "Process exited");
                self.pid = None;
                false
            }
            Err(e) => {
                warn!(label = %self.label, error = %e, "Failed to poll process");
                self.pid = None;
                false
            }
        }
    }

    async fn terminate(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        if !self.is_alive() {
            return;
        }

        self.request_stop(pid);
        match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(label = %self.label, pid, %status, "Process stopped");
            }
            Ok(Err(e)) => {
                warn!(label = %self.label, pid, error = %e, "Failed waiting for process");
            }
            Err(_) => {
                warn!(label = %self.label, pid, "Process ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(label = %self.label, pid, error = %e, "Failed to kill process");
                }
            }
        }
        self.pid = None;
    }
}
