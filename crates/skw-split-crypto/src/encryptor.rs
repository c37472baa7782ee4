use crate::types::{DecryptionError, EncryptionError};

/// Byte transform applied around every payload that leaves a segment.
///
/// Implementations must round-trip (`decrypt(encrypt(x)) == x`) and must
/// refuse malformed or modified ciphertext instead of returning garbage.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError>;
}
