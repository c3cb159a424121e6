//! Per-user request authentication

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::RpcError;
use crate::keys::crypto;

const AUTH_KEY_LEN: usize = 32;

/// Generate a fresh hex encoded auth key for a new operator.
pub fn gen_user_key() -> String {
    let key: Zeroizing<[u8; AUTH_KEY_LEN]> = Zeroizing::new(crypto::generate_random_bytes());
    hex::encode(key.as_slice())
}

/// Shared secret between the supervisor and one operator
#[derive(Clone)]
pub struct AuthKey(Zeroizing<[u8; AUTH_KEY_LEN]>);

impl AuthKey {
    pub fn from_hex(encoded: &str) -> Result<Self, RpcError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|_| RpcError::Credentials("auth key is not hex".into()))?,
        );
        let key: [u8; AUTH_KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| RpcError::Credentials(format!("auth key must be {AUTH_KEY_LEN} bytes")))?;
        Ok(Self(Zeroizing::new(key)))
    }

    fn random() -> Self {
        Self(Zeroizing::new(crypto::generate_random_bytes()))
    }

    /// MAC binding `request` to `user` and the session `nonce`.
    pub fn sign(&self, nonce: &[u8], user: &str, request: &str) -> [u8; 32] {
        crypto::hmac_sha256(self.0.as_slice(), &mac_message(nonce, user, request))
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

fn mac_message(nonce: &[u8], user: &str, request: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(nonce.len() + user.len() + request.len() + 2);
    message.extend_from_slice(nonce);
    message.push(0);
    message.extend_from_slice(user.as_bytes());
    message.push(0);
    message.extend_from_slice(request.as_bytes());
    message
}

/// Registered operators
pub struct UserRegistry {
    users: HashMap<String, AuthKey>,
    /// Stands in for unknown users so they cost the same as known ones
    dummy: AuthKey,
}

impl UserRegistry {
    pub fn new(users: HashMap<String, AuthKey>) -> Self {
        Self {
            users,
            dummy: AuthKey::random(),
        }
    }

    /// Build from the `user -> hex key` table in the config.
    pub fn from_hex_map(users: &BTreeMap<String, String>) -> Result<Self, RpcError> {
        let users = users
            .iter()
            .map(|(name, key)| Ok((name.clone(), AuthKey::from_hex(key)?)))
            .collect::<Result<HashMap<_, _>, RpcError>>()?;
        Ok(Self::new(users))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check `mac_hex` for `request` from `user` in the session with `nonce`.
    pub fn verify(&self, user: &str, nonce: &[u8], request: &str, mac_hex: &str) -> bool {
        let (key, known) = match self.users.get(user) {
            Some(key) => (key, true),
            None => (&self.dummy, false),
        };
        let expected = key.sign(nonce, user, request);

        let presented = hex::decode(mac_hex).unwrap_or_default();
        let matches: bool = if presented.len() == expected.len() {
            expected.as_slice().ct_eq(presented.as_slice()).into()
        } else {
            let _ = expected.as_slice().ct_eq(&[0u8; 32][..]);
            false
        };

        known & matches
    }
}
