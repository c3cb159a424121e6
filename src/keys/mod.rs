//! Key custody
//!
//! Derives the supervisor's root key from an operator secret and hands out
//! labelled subsidiary keys.
//!
//! ```text
//! operator secret ──Argon2id(salt, params)──▶ RootKey ──HKDF("backup")──▶ backup key
//!                                               │
//!                                               └──HMAC tag──▶ KeyDescriptor.check
//! ```
//!
//! Only the [`KeyDescriptor`] is ever persisted. It records the KDF profile,
//! salt and parameters plus a check tag that lets [`KeyDescriptor::unlock`]
//! tell a wrong secret apart from a right one without revealing anything else.

pub mod crypto;

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crypto::{KEY_LEN, SALT_LEN};

/// Label of the subsidiary key that encrypts validator data backups
pub const BACKUP_KEY_LABEL: &str = "backup";

/// Key custody errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Unknown KDF profile: {0}")]
    InvalidProfile(String),

    /// Covers every unlock failure so callers get no validity oracle
    #[error("Incorrect secret")]
    IncorrectSecret,

    #[error("Key descriptor format error: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named Argon2id parameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfProfile {
    /// Production strength
    #[serde(rename = "argon2id")]
    Argon2id,
    /// Test-only, far below production cost
    #[serde(rename = "argon2id_weak")]
    Argon2idWeak,
}

impl KdfProfile {
    pub fn from_name(name: &str) -> Result<Self, KeyError> {
        match name {
            "argon2id" => Ok(Self::Argon2id),
            "argon2id_weak" => Ok(Self::Argon2idWeak),
            other => Err(KeyError::InvalidProfile(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Argon2id => "argon2id",
            Self::Argon2idWeak => "argon2id_weak",
        }
    }

    pub fn is_weak(self) -> bool {
        matches!(self, Self::Argon2idWeak)
    }

    pub fn params(self) -> KdfParams {
        match self {
            Self::Argon2id => KdfParams {
                memory_kib: crypto::ARGON2_MEMORY_KB,
                iterations: crypto::ARGON2_ITERATIONS,
                parallelism: crypto::ARGON2_PARALLELISM,
            },
            Self::Argon2idWeak => KdfParams {
                memory_kib: 8,
                iterations: 1,
                parallelism: 1,
            },
        }
    }
}

impl fmt::Display for KdfProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Argon2id cost parameters recorded in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Whether the cost stays under the ceilings a descriptor may request
    pub fn within_limits(&self) -> bool {
        self.memory_kib <= crypto::ARGON2_MAX_MEMORY_KB
            && self.iterations <= crypto::ARGON2_MAX_ITERATIONS
            && self.parallelism <= crypto::ARGON2_MAX_PARALLELISM
    }
}

/// Non-secret record describing how to rebuild the root key from a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub algorithm: KdfProfile,
    /// Hex-encoded random salt
    pub salt: String,
    pub params: KdfParams,
    /// Hex-encoded unlock check tag
    pub check: String,
}

impl KeyDescriptor {
    /// Derive a fresh root key from `secret` under the named KDF profile.
    pub fn generate(secret: &str, profile: &str) -> Result<(Self, RootKey), KeyError> {
        let profile = KdfProfile::from_name(profile)?;
        let params = profile.params();
        let salt: [u8; SALT_LEN] = crypto::generate_random_bytes();

        let key = crypto::argon2id_stretch(
            secret.as_bytes(),
            &salt,
            params.memory_kib,
            params.iterations,
            params.parallelism,
        )?;
        let root = RootKey { bytes: key };

        let descriptor = Self {
            algorithm: profile,
            salt: hex::encode(salt),
            params,
            check: hex::encode(crypto::check_tag(&root.bytes)),
        };

        info!(profile = %profile, "Generated new root key descriptor");
        Ok((descriptor, root))
    }

    /// Recompute the root key from `secret`.
    ///
    /// Every failure collapses to [`KeyError::IncorrectSecret`].
    pub fn unlock(&self, secret: &str) -> Result<RootKey, KeyError> {
        if !self.params.within_limits() {
            debug!(params = ?self.params, "KDF parameters exceed limits");
            return Err(KeyError::IncorrectSecret);
        }
        let salt = hex::decode(&self.salt).map_err(|_| KeyError::IncorrectSecret)?;
        let expected = hex::decode(&self.check).map_err(|_| KeyError::IncorrectSecret)?;

        let key = crypto::argon2id_stretch(
            secret.as_bytes(),
            &salt,
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
        )
        .map_err(|e| {
            debug!(error = %e, "Root key derivation failed");
            KeyError::IncorrectSecret
        })?;

        let tag = crypto::check_tag(&key);
        if !bool::from(tag.as_slice().ct_eq(expected.as_slice())) {
            return Err(KeyError::IncorrectSecret);
        }

        Ok(RootKey { bytes: key })
    }

    /// Read a descriptor persisted as JSON.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| KeyError::Format(e.to_string()))
    }

    /// Persist the descriptor as JSON with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        let encoded =
            serde_json::to_vec_pretty(self).map_err(|e| KeyError::Format(e.to_string()))?;
        fs::write(path, encoded)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

/// Master key unlocked from the operator secret. Zeroed on drop.
pub struct RootKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl RootKey {
    /// Derive the subsidiary key for `label`.
    pub fn derive(&self, label: &str) -> SubKey {
        SubKey {
            bytes: crypto::hkdf_derive(&self.bytes, label),
        }
    }

    pub fn derive_backup_key(&self) -> SubKey {
        self.derive(BACKUP_KEY_LABEL)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootKey(<redacted>)")
    }
}

/// Key derived from a [`RootKey`] for one purpose. Zeroed on drop.
#[derive(Clone)]
pub struct SubKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl SubKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Wrap raw key material, e.g. a key read back from an offline tool.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }
}

impl PartialEq for SubKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.as_slice().ct_eq(other.bytes.as_slice()).into()
    }
}

impl Eq for SubKey {}

impl fmt::Debug for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubKey(<redacted>)")
    }
}
