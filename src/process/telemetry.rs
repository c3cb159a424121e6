//! Log shipping agent run alongside the validator

use std::time::Duration;

use tracing::{info, warn};

use super::{CommandBackend, CommandTemplate, LaunchSpec, ProcessBackend, ProcessHandle};
use crate::config::TelemetryConfig;

/// Optional sidecar process (e.g. promtail) that ships validator logs.
///
/// Telemetry is best-effort: a failed launch is logged and never blocks the
/// validator.
pub struct TelemetryAgent {
    backend: CommandBackend,
    handle: Option<Box<dyn ProcessHandle>>,
}

impl TelemetryAgent {
    pub fn new(template: CommandTemplate, stop_grace: Duration) -> Self {
        Self {
            backend: CommandBackend::new(template, stop_grace),
            handle: None,
        }
    }

    /// Build the agent described by `config`, `None` when disabled.
    pub fn from_config(config: &TelemetryConfig, stop_grace: Duration) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let template = CommandTemplate::new(config.program.clone(), config.args.clone(), "telemetry");
        Some(Self::new(template, stop_grace))
    }

    pub fn is_running(&mut self) -> bool {
        self.handle.as_mut().is_some_and(|h| h.is_alive())
    }

    pub async fn start(&mut self, spec: &LaunchSpec<'_>) {
        if self.is_running() {
            return;
        }
        match self.backend.launch(spec).await {
            Ok(handle) => {
                info!(pid = ?handle.pid(), "Telemetry agent started");
                self.handle = Some(handle);
            }
            Err(e) => warn!(error = %e, "Telemetry agent failed to start"),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate().await;
            info!("Telemetry agent stopped");
        }
    }
}
