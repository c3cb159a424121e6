//! Control channel server

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::auth::UserRegistry;
use super::protocol::{
    read_frame, write_frame, AuthenticatedRequest, Challenge, FaultKind, Request, Response,
};
use super::RpcError;
use crate::error::SupervisorError;
use crate::keys::crypto;
use crate::supervisor::SupervisorHandle;

/// Budget for the handshake and the request frame
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound, not yet serving, control channel listener
pub struct RpcServer {
    listener: UnixListener,
    acceptor: TlsAcceptor,
    users: Arc<UserRegistry>,
    supervisor: SupervisorHandle,
    path: PathBuf,
}

impl RpcServer {
    /// Bind the socket at `path` with owner-only permissions.
    ///
    /// A leftover socket file from a previous run is removed first.
    pub fn bind(
        path: &Path,
        tls: Arc<ServerConfig>,
        users: UserRegistry,
        supervisor: SupervisorHandle,
    ) -> Result<Self, RpcError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %path.display(), users = users.len(), "Control channel listening");
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            users: Arc::new(users),
            supervisor,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve connections on a background task.
    pub fn spawn(self) -> RunningServer {
        let (close_tx, close_rx) = watch::channel(false);
        let path = self.path.clone();
        let task = tokio::spawn(self.serve(close_rx));
        RunningServer {
            path,
            close_tx,
            task,
        }
    }

    async fn serve(self, mut close: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = close.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let acceptor = self.acceptor.clone();
                        let users = self.users.clone();
                        let supervisor = self.supervisor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, acceptor, &users, &supervisor).await {
                                debug!(error = %e, "Control session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control connection");
                    }
                },
            }
        }
    }
}

/// Handle to a serving control channel
pub struct RunningServer {
    path: PathBuf,
    close_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and unlink the socket.
    pub async fn close(self) {
        let _ = self.close_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Control channel task failed");
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Control channel closed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket"),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), RpcError> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    return Err(RpcError::Io(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a socket", path.display()),
                    )));
                }
            }
            #[cfg(not(unix))]
            let _ = metadata;
            debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn handle_connection(
    stream: UnixStream,
    acceptor: TlsAcceptor,
    users: &UserRegistry,
    supervisor: &SupervisorHandle,
) -> Result<(), RpcError> {
    let session = async move {
        let mut tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| RpcError::Tls(e.to_string()))?;

        let nonce: [u8; 32] = crypto::generate_random_bytes();
        write_frame(&mut tls, &Challenge { nonce: hex::encode(nonce) }).await?;
        let request: AuthenticatedRequest = read_frame(&mut tls).await?;
        Ok::<_, RpcError>((tls, nonce, request))
    };
    let (mut tls, nonce, request) = tokio::time::timeout(SESSION_TIMEOUT, session)
        .await
        .map_err(|_| RpcError::Timeout)??;

    let response = if !users.verify(&request.user, &nonce, &request.request, &request.mac) {
        warn!(id = %request.id, "Rejected unauthenticated control request");
        Response::unauthorized()
    } else {
        match serde_json::from_str::<Request>(&request.request) {
            Ok(call) => {
                info!(id = %request.id, user = %request.user, method = call.method(), "Control request");
                dispatch(call, supervisor).await
            }
            Err(e) => Response::fault(FaultKind::InvalidRequest, e.to_string()),
        }
    };

    write_frame(&mut tls, &response).await?;
    // Best-effort close_notify
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut tls).await;
    Ok(())
}

async fn dispatch(request: Request, supervisor: &SupervisorHandle) -> Response {
    let result = match request {
        Request::GetHealth => return Response::ok(&supervisor.health()),
        Request::StopValidator => supervisor.stop_validator().await.map(|r| Response::ok(&r)),
        Request::StartValidator => supervisor.start_validator().await.map(|r| Response::ok(&r)),
        Request::SetValidatorRelease { release } => supervisor
            .set_validator_release(release)
            .await
            .map(|()| Response::ok(&())),
        Request::ConnectEth2Node { host, port } => supervisor
            .connect_to(host, port)
            .await
            .map(|()| Response::ok(&())),
        Request::Backup => supervisor.backup().await.map(|r| Response::ok(&r)),
    };
    result.unwrap_or_else(|e| fault_for(&e))
}

fn fault_for(error: &SupervisorError) -> Response {
    let kind = match error {
        SupervisorError::NotStopped(_) => FaultKind::NotStopped,
        SupervisorError::InvalidRequest(_) => FaultKind::InvalidRequest,
        SupervisorError::ShuttingDown | SupervisorError::Unavailable => FaultKind::ShuttingDown,
        _ => FaultKind::Failed,
    };
    Response::fault(kind, error.to_string())
}
