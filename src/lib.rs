//! validator-supervisor: unattended supervisor for a blockchain validator client
//!
//! Keeps one validator client process running against a set of upstream
//! consensus nodes while the signing keys stay encrypted at rest:
//!
//! - [`keys`] turns an operator secret into a root key and derives purpose keys
//! - [`backup`] seals the validator data directory into one encrypted archive
//! - [`supervisor`] owns the process lifecycle and node failover
//! - [`rpc`] lets an authenticated operator drive the supervisor remotely

pub mod backup;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod process;
pub mod release;
pub mod rpc;
pub mod supervisor;

pub use config::Config;
pub use error::{Result, SupervisorError};
pub use keys::{KeyDescriptor, RootKey, SubKey};
pub use release::ValidatorRelease;
pub use supervisor::{Health, LifecycleState, NodeEndpoint, Supervisor, SupervisorHandle};
