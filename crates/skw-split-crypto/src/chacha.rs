use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::{rngs::OsRng, RngCore};

use crate::encryptor::Encryptor;
use crate::kdf::{derive_envelope_key, SharedSecret};
use crate::types::{DecryptionError, EncryptionError, NONCE_LEN, TAG_LEN};

/// ChaCha20-Poly1305 over a key derived from the segments' shared secret.
///
/// Output layout is `nonce || ciphertext || tag`, with a fresh random nonce
/// per call.
pub struct ChaChaEncryptor {
    cipher: ChaCha20Poly1305,
}

impl ChaChaEncryptor {
    pub fn new(secret: &SharedSecret) -> Self {
        let key = derive_envelope_key(secret);
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }
}

impl Encryptor for ChaChaEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EncryptionError::SealFailed)?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);
        Ok(ciphertext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptionError::Malformed(ciphertext.len()));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DecryptionError::Tampered)
    }
}
