use std::fmt;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::canonical::canonical_bytes;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC on both inbound and outbound messages.
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(thiserror::Error, Debug)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// HMAC-SHA256 signer over canonical JSON, keyed with the shared secret.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SigningError> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Lowercase hex HMAC of the message's canonical bytes.
    pub fn sign(&self, message: &Value) -> String {
        let mut mac = self.mac.clone();
        mac.update(&canonical_bytes(message));
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of `signature` against the message.
    ///
    /// Malformed hex or a wrong-length digest is simply a mismatch.
    pub fn verify(&self, message: &Value, signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };

        let mut mac = self.mac.clone();
        mac.update(&canonical_bytes(message));
        mac.verify_slice(&expected).is_ok()
    }
}
