//! Remote control protocol
//!
//! Operators drive a running supervisor through a Unix domain socket wrapped
//! in mutual TLS. Each connection carries exactly one request:
//!
//! ```text
//! server -> client   Challenge { nonce }
//! client -> server   AuthenticatedRequest { user, request, mac }
//! server -> client   Response
//! ```
//!
//! `mac` is HMAC-SHA256 under the user's auth key over
//! `nonce || 0x00 || user || 0x00 || request`, so a captured request cannot be
//! replayed on another connection.

pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;
pub mod tls;

use std::path::PathBuf;

pub use auth::{gen_user_key, AuthKey, UserRegistry};
pub use client::RpcClient;
pub use protocol::{Request, Response};
pub use server::{RpcServer, RunningServer};

/// Control channel errors
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Carries no detail about which check failed
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Connection refused: {0}")]
    ConnectionRefused(PathBuf),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid credentials: {0}")]
    Credentials(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
