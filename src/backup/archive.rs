//! Archive wire format
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬───────────┬──────────────┬──────────────────────┐
//! │ "VSBK" 4 │ ver  1  │ key_id 8 │ nonce 12  │ crc32(hdr) 4 │ ChaCha20-Poly1305 ct │
//! └──────────┴─────────┴──────────┴───────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The full 29-byte header is the AEAD associated data. The CRC only guards
//! the header so that a damaged `key_id` is reported as corruption rather
//! than as a wrong key; authenticity comes from the AEAD tag alone.

use std::fs;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::BackupError;
use crate::keys::crypto;

pub const MAGIC: &[u8; 4] = b"VSBK";
pub const FORMAT_VERSION: u8 = 1;
pub const KEY_ID_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;
pub const HEADER_LEN: usize = 4 + 1 + KEY_ID_LEN + NONCE_LEN + 4;

const KEY_ID_MESSAGE: &[u8] = b"validator-supervisor backup key id";

/// Parsed archive header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key_id: [u8; KEY_ID_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(MAGIC);
        out[4] = FORMAT_VERSION;
        out[5..13].copy_from_slice(&self.key_id);
        out[13..25].copy_from_slice(&self.nonce);
        let crc = crc32fast::hash(&out[..25]);
        out[25..29].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Parse and integrity-check the header at the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, BackupError> {
        if bytes.len() < HEADER_LEN {
            return Err(BackupError::CorruptArchive("truncated header".into()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(BackupError::CorruptArchive("bad magic".into()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(BackupError::CorruptArchive(format!(
                "unsupported format version {}",
                bytes[4]
            )));
        }

        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[25..29]);
        if crc32fast::hash(&bytes[..25]) != u32::from_be_bytes(crc) {
            return Err(BackupError::CorruptArchive("header checksum mismatch".into()));
        }

        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&bytes[5..13]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[13..25]);

        Ok(Self { key_id, nonce })
    }
}

/// Short public fingerprint of a backup key.
pub fn key_id(key: &[u8; crypto::KEY_LEN]) -> [u8; KEY_ID_LEN] {
    let tag = crypto::hmac_sha256(key, KEY_ID_MESSAGE);
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&tag[..KEY_ID_LEN]);
    id
}

/// One node of the serialized tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// `/`-separated path relative to the archive root
    pub path: String,
    /// Unix permission bits
    pub mode: u32,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Dir,
    File { contents: Vec<u8> },
}

/// Serialized plaintext of an archive
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<Entry>,
}

impl Tree {
    /// Walk `root` recursively. Entries come out in a stable, sorted order.
    pub fn collect(root: &Path) -> Result<Self, BackupError> {
        let mut tree = Tree::default();
        collect_dir(root, "", &mut tree.entries)?;
        Ok(tree)
    }

    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::File { .. }))
            .count()
    }

    /// Reject any entry that could escape the restore root.
    pub fn validate(&self) -> Result<(), BackupError> {
        for entry in &self.entries {
            let path = Path::new(&entry.path);
            let safe = !entry.path.is_empty()
                && path
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !safe {
                return Err(BackupError::CorruptArchive(format!(
                    "unsafe entry path {:?}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

fn collect_dir(dir: &Path, prefix: &str, out: &mut Vec<Entry>) -> Result<(), BackupError> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name();
        let Some(name) = name.to_str() else {
            return Err(BackupError::UnsupportedPath(child.path()));
        };
        let rel = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };

        let meta = fs::symlink_metadata(child.path())?;
        if meta.is_dir() {
            out.push(Entry {
                path: rel.clone(),
                mode: file_mode(&meta, 0o755),
                kind: EntryKind::Dir,
            });
            collect_dir(&child.path(), &rel, out)?;
        } else if meta.is_file() {
            out.push(Entry {
                path: rel,
                mode: file_mode(&meta, 0o644),
                kind: EntryKind::File {
                    contents: fs::read(child.path())?,
                },
            });
        } else {
            warn!(path = %child.path().display(), "Skipping symlink or special file in backup");
        }
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata, _default: u32) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata, default: u32) -> u32 {
    default
}
