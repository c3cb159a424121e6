//! Wire types and framing
//!
//! Frames are a big-endian `u32` length followed by that many bytes of JSON.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RpcError;
use crate::release::ValidatorRelease;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Operations exposed over the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    GetHealth,
    StopValidator,
    StartValidator,
    SetValidatorRelease { release: ValidatorRelease },
    ConnectEth2Node { host: String, port: u16 },
    Backup,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetHealth => "get_health",
            Self::StopValidator => "stop_validator",
            Self::StartValidator => "start_validator",
            Self::SetValidatorRelease { .. } => "set_validator_release",
            Self::ConnectEth2Node { .. } => "connect_eth2_node",
            Self::Backup => "backup",
        }
    }
}

/// First frame of every session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    /// 32 random bytes, hex
    pub nonce: String,
}

/// Client's single request, bound to the session nonce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedRequest {
    /// Correlation id echoed in logs
    pub id: String,
    pub user: String,
    /// JSON encoded [`Request`], authenticated verbatim
    pub request: String,
    /// Hex HMAC-SHA256
    pub mac: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Unauthorized,
    InvalidRequest,
    NotStopped,
    ShuttingDown,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { result: serde_json::Value },
    Error { fault: Fault },
}

impl Response {
    pub fn ok<T: Serialize>(result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self::Ok { result },
            Err(e) => Self::fault(FaultKind::Failed, e.to_string()),
        }
    }

    pub fn fault(kind: FaultKind, message: impl Into<String>) -> Self {
        Self::Error {
            fault: Fault {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized() -> Self {
        Self::fault(FaultKind::Unauthorized, "unauthorized")
    }

    /// Decode the result payload or map the fault onto an [`RpcError`].
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        match self {
            Self::Ok { result } => serde_json::from_value(result)
                .map_err(|e| RpcError::Protocol(format!("unexpected result shape: {e}"))),
            Self::Error { fault } => Err(match fault.kind {
                FaultKind::Unauthorized => RpcError::Unauthorized,
                FaultKind::InvalidRequest => RpcError::InvalidRequest(fault.message),
                _ => RpcError::Remote(fault.message),
            }),
        }
    }
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).map_err(|e| RpcError::Protocol(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len()).map_err(|e| RpcError::Protocol(e.to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| RpcError::Protocol(e.to_string()))
}
