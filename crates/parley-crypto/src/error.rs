use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("entropy source unavailable")]
    Entropy,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: wrong key, corrupted or truncated payload")]
    Decryption,

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}
