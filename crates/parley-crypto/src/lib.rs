//! Parley cryptographic layer.
//!
//! This crate provides:
//! - Session key pair generation and custody ([`KeyVault`])
//! - Sealed-box authenticated public-key encryption ([`CipherEngine`])

pub mod cipher;
pub mod error;
pub mod identity;

pub use cipher::{CipherEngine, NonceSource, OsNonces, NONCE_LEN, SEAL_OVERHEAD, TAG_LEN};
pub use error::CryptoError;
pub use identity::{KeyVault, PublicKey, SecretKey, KEY_LEN};
