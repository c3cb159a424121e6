//! Control channel client

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::auth::AuthKey;
use super::protocol::{read_frame, write_frame, AuthenticatedRequest, Challenge, Request, Response};
use super::RpcError;
use crate::release::ValidatorRelease;
use crate::supervisor::models::{BackupReport, Health};

/// Default budget for one request, connect to response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operator side of the control channel. One connection per request.
pub struct RpcClient {
    user: String,
    auth_key: AuthKey,
    socket_path: PathBuf,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(
        user: impl Into<String>,
        auth_key: AuthKey,
        socket_path: impl Into<PathBuf>,
        tls: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        Self {
            user: user.into(),
            auth_key,
            socket_path: socket_path.into(),
            connector: TlsConnector::from(tls),
            server_name,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn get_health(&self) -> Result<Health, RpcError> {
        self.call(&Request::GetHealth).await
    }

    /// Returns true iff the validator was running.
    pub async fn stop_validator(&self) -> Result<bool, RpcError> {
        self.call(&Request::StopValidator).await
    }

    pub async fn start_validator(&self) -> Result<bool, RpcError> {
        self.call(&Request::StartValidator).await
    }

    pub async fn set_validator_release(&self, release: ValidatorRelease) -> Result<(), RpcError> {
        self.call(&Request::SetValidatorRelease { release }).await
    }

    pub async fn connect_eth2_node(&self, host: impl Into<String>, port: u16) -> Result<(), RpcError> {
        self.call(&Request::ConnectEth2Node {
            host: host.into(),
            port,
        })
        .await
    }

    pub async fn backup(&self) -> Result<BackupReport, RpcError> {
        self.call(&Request::Backup).await
    }

    async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T, RpcError> {
        let response = tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| RpcError::Timeout)??;
        response.into_result()
    }

    async fn exchange(&self, request: &Request) -> Result<Response, RpcError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    RpcError::ConnectionRefused(self.socket_path.clone())
                }
                _ => RpcError::Io(e),
            })?;

        let mut tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| RpcError::Tls(e.to_string()))?;

        let challenge: Challenge = read_frame(&mut tls).await?;
        let nonce = hex::decode(&challenge.nonce)
            .map_err(|_| RpcError::Protocol("challenge nonce is not hex".to_string()))?;

        let body = serde_json::to_string(request).map_err(|e| RpcError::Protocol(e.to_string()))?;
        let mac = self.auth_key.sign(&nonce, &self.user, &body);
        let id = uuid::Uuid::new_v4().to_string();
        debug!(id = %id, method = request.method(), "Sending control request");

        write_frame(
            &mut tls,
            &AuthenticatedRequest {
                id,
                user: self.user.clone(),
                request: body,
                mac: hex::encode(mac),
            },
        )
        .await?;

        read_frame(&mut tls).await
    }
}
