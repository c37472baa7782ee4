use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EncryptionError {
    #[error("aead seal failed")]
    SealFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DecryptionError {
    #[error("ciphertext too short: {0} bytes")]
    Malformed(usize),
    #[error("ciphertext failed authentication")]
    Tampered,
}
