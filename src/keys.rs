//! Account key material.
//!
//! A 32-byte seed (from the mnemonic, zero-padded) deterministically yields
//! both key pairs of an account:
//!
//! * Ed25519: standard seed construction, used for signing.
//! * X25519: `clamp(SHA-512(seed)[0..32])` as the secret scalar
//!   (RFC 7748 §5), used for sealed-box encryption. The session id is
//!   `"05" + hex(x25519 public)`.
//!
//! Both key types live on Curve25519; a sender's Ed25519 public key converts
//! to the Montgomery form to recover their session id on receive.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::mnemonic::{self, MnemonicError};

/// Prefix distinguishing X25519 session ids on the wire.
pub const SESSION_ID_PREFIX: &str = "05";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] MnemonicError),
    #[error("invalid public key bytes")]
    InvalidPublicKey,
}

/// The Ed25519 and X25519 key pairs of one account.
#[derive(Clone)]
pub struct KeyPair {
    pub ed25519: SigningKey,
    pub x25519_secret: StaticSecret,
    pub x25519_public: X25519Public,
}

impl KeyPair {
    /// Derive both key pairs from a 32-byte account seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let ed25519 = SigningKey::from_bytes(seed);
        let x25519_secret = ed25519_seed_to_x25519(seed);
        let x25519_public = X25519Public::from(&x25519_secret);
        Self { ed25519, x25519_secret, x25519_public }
    }

    /// Derive a key pair from a 13-word mnemonic.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, KeyError> {
        let seed = mnemonic::mnemonic_to_seed(phrase)?;
        Ok(Self::from_seed(&seed))
    }

    /// Generate a fresh random key pair (ephemeral accounts, tests).
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn ed25519_public(&self) -> VerifyingKey {
        self.ed25519.verifying_key()
    }

    /// The account's session id: `"05" + hex(x25519 public)`, 66 chars.
    pub fn session_id(&self) -> String {
        format!("{SESSION_ID_PREFIX}{}", hex::encode(self.x25519_public.as_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print secret material
        f.debug_struct("KeyPair")
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
/// SHA-512/clamp derivation (RFC 7748 §5).
pub fn ed25519_seed_to_x25519(seed: &[u8; 32]) -> StaticSecret {
    let hash = Sha512::digest(seed);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert an Ed25519 compressed public key to X25519 Montgomery form.
///
/// Fails on byte strings that do not decompress to a curve point.
pub fn ed25519_pubkey_to_x25519(pubkey: &[u8; 32]) -> Result<X25519Public, KeyError> {
    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or(KeyError::InvalidPublicKey)?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}
