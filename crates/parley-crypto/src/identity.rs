//! Session key pair generation and custody.
//!
//! Each session generates one Curve25519 key pair at startup. The secret
//! half never leaves the [`KeyVault`]: it has no byte accessor, is not
//! serializable, and is zeroized when the vault is dropped.

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;
use x25519_dalek::{SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::cipher::CipherEngine;
use crate::error::CryptoError;

/// Curve25519 key length.
pub const KEY_LEN: usize = 32;

/// A peer's (or our own) public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Parse a public key received from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Short hex fingerprint for logs: first 8 bytes of the key.
    pub fn fingerprint(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    pub(crate) fn to_dalek(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// The local secret key. Only usable through a [`CipherEngine`].
pub struct SecretKey(StaticSecret);

impl SecretKey {
    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.0.diffie_hellman(&peer.to_dalek())
    }

    fn public_key(&self) -> PublicKey {
        PublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Owns the session key pair and seals/opens payloads with it.
pub struct KeyVault {
    secret: SecretKey,
    public: PublicKey,
    cipher: CipherEngine,
}

impl KeyVault {
    /// Generate a fresh key pair from the OS CSPRNG.
    ///
    /// Fails only when the entropy source is unavailable; callers must treat
    /// that as fatal for the session.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with(CipherEngine::new())
    }

    pub(crate) fn generate_with(cipher: CipherEngine) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut seed = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill(&mut seed[..]).map_err(|_| CryptoError::Entropy)?;

        let secret = SecretKey(StaticSecret::from(*seed));
        let public = secret.public_key();
        debug!(key = %public.fingerprint(), "generated session key pair");

        Ok(Self {
            secret,
            public,
            cipher,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Seal `plaintext` for `recipient`.
    pub fn seal(&self, plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        self.cipher.seal(plaintext, recipient, &self.secret)
    }

    /// Open a payload `sender` sealed for us.
    pub fn open(&self, sealed: &[u8], sender: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        self.cipher.open(sealed, sender, &self.secret)
    }

    /// Open a payload and interpret it as UTF-8 text.
    pub fn open_text(&self, sealed: &[u8], sender: &PublicKey) -> Result<String, CryptoError> {
        let bytes = self.open(sealed, sender)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::InvalidUtf8)
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVault")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
