//! Validator client releases
//!
//! A release names the validator client to run and pins its content with a
//! SHA-256 checksum. Releases are immutable; switching release means a full
//! stop/start of the validator process.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Release validation and verification errors
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("Invalid release: {0}")]
    Invalid(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifies the validator client software to run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ReleaseFields")]
pub struct ValidatorRelease {
    impl_name: String,
    version: String,
    checksum: String,
}

/// Unvalidated wire form
#[derive(Deserialize)]
struct ReleaseFields {
    impl_name: String,
    version: String,
    checksum: String,
}

impl TryFrom<ReleaseFields> for ValidatorRelease {
    type Error = ReleaseError;

    fn try_from(fields: ReleaseFields) -> Result<Self, Self::Error> {
        ValidatorRelease::new(fields.impl_name, fields.version, fields.checksum)
    }
}

impl ValidatorRelease {
    /// Build a release, validating every field.
    ///
    /// The checksum must be a 64 digit hex SHA-256; it is stored lowercase.
    pub fn new(
        impl_name: impl Into<String>,
        version: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Result<Self, ReleaseError> {
        let impl_name = impl_name.into();
        let version = version.into();
        let checksum = checksum.into().to_ascii_lowercase();

        if impl_name.is_empty()
            || !impl_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ReleaseError::Invalid(format!(
                "implementation name {impl_name:?} must be non-empty [A-Za-z0-9_-]"
            )));
        }
        if version.is_empty() || version.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ReleaseError::Invalid(format!(
                "version {version:?} must be non-empty without whitespace or '/'"
            )));
        }
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReleaseError::Invalid(
                "checksum must be 64 hex digits (SHA-256)".to_string(),
            ));
        }

        Ok(Self {
            impl_name,
            version,
            checksum,
        })
    }

    pub fn impl_name(&self) -> &str {
        &self.impl_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Verify the SHA-256 of the artifact at `path` against this release.
    pub fn verify_artifact(&self, path: &Path) -> Result<(), ReleaseError> {
        let actual = sha256_file(path)?;
        if actual != self.checksum {
            return Err(ReleaseError::ChecksumMismatch {
                path: path.display().to_string(),
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ValidatorRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.impl_name, self.version)
    }
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
