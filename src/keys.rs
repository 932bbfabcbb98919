//! Device keypair for certificate requests and WireGuard probing
//!
//! One X25519 keypair per device/session. The public half rides in
//! certificate requests as `ClientPublicKey`; the private half stays on the
//! device and never leaves the session storage.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid Base64 key: {0}")]
    InvalidEncoding(String),

    #[error("Key must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// X25519 device keypair, both halves Base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeypair {
    pub private_key: String,
    pub public_key: String,
}

impl DeviceKeypair {
    /// Generate a fresh keypair. The private key is created locally and only
    /// the public key is ever sent to the backend.
    pub fn generate() -> Self {
        use rand::rngs::OsRng;

        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key);

        Self {
            private_key: BASE64.encode(private_key.as_bytes()),
            public_key: BASE64.encode(public_key.as_bytes()),
        }
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], KeyError> {
        parse_key(&self.public_key)
    }
}

/// Parse a Base64 key into raw bytes, enforcing the X25519 length.
pub fn parse_key(key_b64: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64
        .decode(key_b64)
        .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;

    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength(bytes.len()));
    }

    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
