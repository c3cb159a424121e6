//! Encrypted validator data backups
//!
//! A backup is the whole validator data directory (signing keystore and
//! slashing-protection records) serialized into one file and sealed with
//! ChaCha20-Poly1305 under the backup key derived from the root key.
//! Restoring a backup is the only way a fresh supervisor gets its data.

pub mod archive;
pub mod transport;

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::{aead::Aead, aead::Payload, ChaCha20Poly1305, Key, KeyInit, Nonce};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::keys::{crypto, SubKey};
use archive::{EntryKind, Header, Tree, HEADER_LEN};

pub use transport::{BackupTransport, RemoteDescriptor, ScpTransport, TransportError};

/// Backup errors
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Corrupt backup archive: {0}")]
    CorruptArchive(String),

    #[error("Backup archive was sealed with a different key")]
    WrongKey,

    #[error("Backup archive not found: {0}")]
    Missing(PathBuf),

    #[error("Path cannot be stored in a backup (not UTF-8): {0}")]
    UnsupportedPath(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of writing an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub path: PathBuf,
    pub file_count: usize,
    pub size_bytes: u64,
}

/// Serialize `source_dir` and seal it into a single archive at `dest_path`.
///
/// The file is written next to its destination and renamed into place.
pub fn create(
    backup_key: &SubKey,
    source_dir: &Path,
    dest_path: &Path,
) -> Result<BackupArchive, BackupError> {
    let tree = Tree::collect(source_dir)?;
    let file_count = tree.file_count();

    let plaintext = Zeroizing::new(
        rmp_serde::to_vec(&tree).map_err(|e| BackupError::Serialization(e.to_string()))?,
    );
    drop(tree);

    let header = Header {
        key_id: archive::key_id(backup_key.as_bytes()),
        nonce: crypto::generate_random_bytes(),
    };
    let header_bytes = header.to_bytes();

    let cipher = ChaCha20Poly1305::new(Key::from_slice(backup_key.as_bytes()));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&header.nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: &header_bytes,
            },
        )
        .map_err(|e| BackupError::Serialization(format!("encryption failed: {e}")))?;

    let mut encoded = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    encoded.extend_from_slice(&header_bytes);
    encoded.extend_from_slice(&ciphertext);

    if let Some(parent) = dest_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = dest_path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, &encoded)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp_path, dest_path)?;

    info!(
        path = %dest_path.display(),
        files = file_count,
        bytes = encoded.len(),
        "Backup archive written"
    );

    Ok(BackupArchive {
        path: dest_path.to_path_buf(),
        file_count,
        size_bytes: encoded.len() as u64,
    })
}

/// Decrypt `archive_path` and rebuild its tree in `dest_dir`.
///
/// Existing contents of `dest_dir` are replaced only after the archive has
/// been fully authenticated and decoded.
pub fn restore(backup_key: &SubKey, archive_path: &Path, dest_dir: &Path) -> Result<(), BackupError> {
    let bytes = match fs::read(archive_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::Missing(archive_path.to_path_buf()))
        }
        Err(e) => return Err(BackupError::Io(e)),
    };

    let tree = open(backup_key, &bytes)?;
    tree.validate()?;

    clear_dir(dest_dir)?;
    materialize(&tree, dest_dir)?;

    info!(
        archive = %archive_path.display(),
        dest = %dest_dir.display(),
        files = tree.file_count(),
        "Backup restored"
    );
    Ok(())
}

/// Authenticate and decode archive bytes.
fn open(backup_key: &SubKey, bytes: &[u8]) -> Result<Tree, BackupError> {
    let header = Header::parse(bytes)?;

    if header.key_id != archive::key_id(backup_key.as_bytes()) {
        return Err(BackupError::WrongKey);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(backup_key.as_bytes()));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&header.nonce),
            Payload {
                msg: &bytes[HEADER_LEN..],
                aad: &bytes[..HEADER_LEN],
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| BackupError::CorruptArchive("authentication failed".into()))?;

    rmp_serde::from_slice(&plaintext)
        .map_err(|e| BackupError::CorruptArchive(format!("undecodable payload: {e}")))
}

fn clear_dir(dir: &Path) -> Result<(), BackupError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }

    for child in fs::read_dir(dir)? {
        let child = child?;
        let meta = fs::symlink_metadata(child.path())?;
        if meta.is_dir() {
            fs::remove_dir_all(child.path())?;
        } else {
            fs::remove_file(child.path())?;
        }
    }
    debug!(dir = %dir.display(), "Cleared restore destination");
    Ok(())
}

fn materialize(tree: &Tree, dest_dir: &Path) -> Result<(), BackupError> {
    for entry in &tree.entries {
        let target = dest_dir.join(&entry.path);
        match &entry.kind {
            EntryKind::Dir => fs::create_dir_all(&target)?,
            EntryKind::File { contents } => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, contents)?;
                set_mode(&target, entry.mode)?;
            }
        }
    }

    // Directory modes last, deepest first, so read-only dirs can be filled
    for entry in tree.entries.iter().rev() {
        if matches!(entry.kind, EntryKind::Dir) {
            set_mode(&dest_dir.join(&entry.path), entry.mode)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), BackupError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), BackupError> {
    Ok(())
}
