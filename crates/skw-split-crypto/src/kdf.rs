use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;

use crate::types::KEY_LEN;

const ENVELOPE_KEY_INFO: &[u8] = b"skw-split envelope key v1";

/// Secret both segments are provisioned with out of band.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(raw: &str) -> Result<Self, String> {
        let bytes = hex::decode(raw.trim())
            .map_err(|e| format!("shared secret is not valid hex: {}", e))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("shared secret must be {} bytes, got {}", KEY_LEN, b.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// never print key material
impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Derive the AEAD key for envelope payloads from the shared secret.
pub fn derive_envelope_key(secret: &SharedSecret) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(ENVELOPE_KEY_INFO, &mut okm)
        .expect("32 bytes is a valid length for Sha256 to output");
    okm
}
