//! Key derivation primitives
//!
//! Argon2id stretches the operator secret into the root key. HKDF-SHA256
//! derives labelled subsidiary keys from it, and an HMAC-SHA256 tag over a
//! fixed message lets a descriptor check an unlock attempt.
//!
//! Production cost is 64 MiB of memory, 3 passes and 4 lanes.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::KeyError;

// =============================================================================
// Constants
// =============================================================================

/// Production Argon2id memory cost in KiB
pub const ARGON2_MEMORY_KB: u32 = 64 * 1024;

pub const ARGON2_ITERATIONS: u32 = 3;

pub const ARGON2_PARALLELISM: u32 = 4;

/// Ceilings for parameters read back from a descriptor (1 GiB of memory)
pub const ARGON2_MAX_MEMORY_KB: u32 = 1024 * 1024;

pub const ARGON2_MAX_ITERATIONS: u32 = 64;

pub const ARGON2_MAX_PARALLELISM: u32 = 16;

pub const SALT_LEN: usize = 16;

/// Length of every symmetric key handled by this crate
pub const KEY_LEN: usize = 32;

/// Domain separation prefix for HKDF info strings
const DERIVE_INFO_PREFIX: &[u8] = b"validator-supervisor/v1/";

/// Message authenticated by the unlock check tag
const CHECK_MESSAGE: &[u8] = b"validator-supervisor key check v1";

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Randomness
// =============================================================================

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Stretch `secret` into a 256-bit key with Argon2id.
pub fn argon2id_stretch(
    secret: &[u8],
    salt: &[u8],
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let params = Params::new(memory_kib, iterations, parallelism, Some(KEY_LEN))
        .map_err(|e| KeyError::Format(format!("invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(secret, salt, key.as_mut())
        .map_err(|e| KeyError::Format(format!("key derivation failed: {e}")))?;

    Ok(key)
}

/// One-way derivation of a labelled subsidiary key.
///
/// Same key + same label always yields the same output; outputs for
/// different labels are independent.
pub fn hkdf_derive(ikm: &[u8; KEY_LEN], label: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(None, ikm);

    let mut info = Vec::with_capacity(DERIVE_INFO_PREFIX.len() + label.len());
    info.extend_from_slice(DERIVE_INFO_PREFIX);
    info.extend_from_slice(label.as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, okm.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Compute the tag stored in a key descriptor to verify an unlock attempt.
pub fn check_tag(root: &[u8; KEY_LEN]) -> [u8; 32] {
    let check_key = hkdf_derive(root, "descriptor-check");
    hmac_sha256(check_key.as_ref(), CHECK_MESSAGE)
}

/// HMAC-SHA256 over `message`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

// =============================================================================
// Tests
// =============================================================================
