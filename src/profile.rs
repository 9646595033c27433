//! Profile data encryption.
//!
//! Display pictures (and other small profile blobs) are encrypted with
//! AES-256-GCM under the account's profile key before upload; the 12-byte
//! IV is prepended to the ciphertext+tag.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

pub const PROFILE_KEY_LEN: usize = 32;
pub const PROFILE_IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileCryptoError {
    #[error("invalid profile key length")]
    InvalidKey,
    #[error("profile ciphertext too short")]
    TooShort,
    #[error("failed to decrypt profile data")]
    Decrypt,
}

/// Encrypt profile data; returns `iv ‖ ciphertext+tag`.
pub fn encrypt_profile(data: &[u8], key: &[u8]) -> Result<Vec<u8>, ProfileCryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| ProfileCryptoError::InvalidKey)?;
    let mut iv = [0u8; PROFILE_IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), data)
        .map_err(|_| ProfileCryptoError::Decrypt)?;

    let mut out = Vec::with_capacity(PROFILE_IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `iv ‖ ciphertext+tag` produced by [`encrypt_profile`].
pub fn decrypt_profile(data: &[u8], key: &[u8]) -> Result<Vec<u8>, ProfileCryptoError> {
    if data.len() < PROFILE_IV_LEN + TAG_LEN + 1 {
        return Err(ProfileCryptoError::TooShort);
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| ProfileCryptoError::InvalidKey)?;
    let (iv, ciphertext) = data.split_at(PROFILE_IV_LEN);
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| ProfileCryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; PROFILE_KEY_LEN] {
        let mut key = [0u8; PROFILE_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn roundtrip() {
        let key = key();
        let data = b"avatar bytes";
        let encrypted = encrypt_profile(data, &key).unwrap();
        assert_eq!(decrypt_profile(&encrypted, &key).unwrap(), data);
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = encrypt_profile(b"avatar", &key()).unwrap();
        assert_eq!(
            decrypt_profile(&encrypted, &key()),
            Err(ProfileCryptoError::Decrypt)
        );
    }

    #[test]
    fn tampered_tag_fails() {
        let key = key();
        let mut encrypted = encrypt_profile(b"avatar", &key).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 1;
        assert_eq!(decrypt_profile(&encrypted, &key), Err(ProfileCryptoError::Decrypt));
    }

    #[test]
    fn short_input_rejected() {
        assert_eq!(
            decrypt_profile(&[0u8; 10], &key()),
            Err(ProfileCryptoError::TooShort)
        );
    }

    #[test]
    fn bad_key_length_rejected() {
        assert_eq!(
            encrypt_profile(b"x", &[0u8; 16]),
            Err(ProfileCryptoError::InvalidKey)
        );
    }
}
