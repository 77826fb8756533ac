//! Message signing contract.
//!
//! Key management and the choice of primitive belong to the host; the
//! protocol only needs a way to sign bytes and verify them later.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies authenticated messages.
pub trait MessageSigner: Send + Sync {
    /// Identifier of the key used by [`MessageSigner::sign`].
    fn key_id(&self) -> &str;

    /// Signs `data`.
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Verifies `signature` over `data` made with key `key_id`.
    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> bool;
}

/// HMAC-SHA256 signer over a shared secret.
pub struct HmacSha256Signer {
    key_id: String,
    secret: Vec<u8>,
}

impl HmacSha256Signer {
    /// Creates a signer.
    pub fn new(key_id: impl Into<String>, secret: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            secret,
        }
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).ok()
    }
}

impl MessageSigner for HmacSha256Signer {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self.mac() {
            Some(mut mac) => {
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            None => Vec::new(),
        }
    }

    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> bool {
        if key_id != self.key_id {
            return false;
        }
        match self.mac() {
            Some(mut mac) => {
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
            None => false,
        }
    }
}

impl fmt::Debug for HmacSha256Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSha256Signer")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
