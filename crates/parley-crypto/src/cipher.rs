//! Sealed-box encryption: X25519 + HKDF-SHA256 + XChaCha20-Poly1305.
//!
//! Wire format: `[ nonce (24) | ciphertext + tag (16) ]`.
//!
//! The nonce is drawn fresh for every seal from the engine's nonce source.
//! There is no way to pass a nonce in, so a caller cannot reuse one.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{PublicKey, SecretKey};

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Bytes a sealed payload adds on top of the plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const KDF_INFO: &[u8] = b"parley sealed box v1";

/// Where nonces come from.
pub trait NonceSource: Send + Sync {
    fn fill_nonce(&self, nonce: &mut [u8; NONCE_LEN]) -> Result<(), CryptoError>;
}

/// Nonces from the operating system CSPRNG.
pub struct OsNonces {
    rng: SystemRandom,
}

impl OsNonces {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for OsNonces {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceSource for OsNonces {
    fn fill_nonce(&self, nonce: &mut [u8; NONCE_LEN]) -> Result<(), CryptoError> {
        self.rng.fill(nonce).map_err(|_| CryptoError::Entropy)
    }
}

/// Authenticated public-key encryption between two Curve25519 key pairs.
pub struct CipherEngine {
    nonces: Box<dyn NonceSource>,
}

impl CipherEngine {
    pub fn new() -> Self {
        Self {
            nonces: Box::new(OsNonces::new()),
        }
    }

    /// Engine with a caller-chosen nonce source. Test builds only.
    #[cfg(test)]
    pub(crate) fn with_nonce_source(nonces: impl NonceSource + 'static) -> Self {
        Self {
            nonces: Box::new(nonces),
        }
    }

    /// Seal `plaintext` for `recipient` under `local`.
    pub fn seal(
        &self,
        plaintext: &[u8],
        recipient: &PublicKey,
        local: &SecretKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = box_key(local, recipient)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::Encryption)?;

        let mut nonce = [0u8; NONCE_LEN];
        self.nonces.fill_nonce(&mut nonce)?;

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a payload that `sender` sealed for `local`.
    pub fn open(
        &self,
        sealed: &[u8],
        sender: &PublicKey,
        local: &SecretKey,
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Decryption);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let key = box_key(local, sender)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::Decryption)?;

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

impl Default for CipherEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the symmetric key two parties share: HKDF-SHA256 over the X25519 output.
fn box_key(local: &SecretKey, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = local.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order public key".into()));
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, &mut key[..])
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}
