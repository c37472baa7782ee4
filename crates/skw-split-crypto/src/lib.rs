pub mod types;
pub mod encryptor;
pub mod chacha;
pub mod kdf;

// re-exports - traits
pub use encryptor::Encryptor;

// re-exports
pub use chacha::ChaChaEncryptor;
pub use kdf::{derive_envelope_key, SharedSecret};
pub use types::{DecryptionError, EncryptionError, KEY_LEN, NONCE_LEN, TAG_LEN};
