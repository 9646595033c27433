//! Attachment encryption.
//!
//! Attachments are encrypted independently of the message that references
//! them: AES-256-CBC with PKCS#7 under the first half of a random 64-byte
//! pointer key, authenticated with HMAC-SHA256 under the second half. The
//! blob layout is `iv(16) ‖ ciphertext ‖ mac(32)` and a SHA-256 digest of
//! the whole blob travels in the attachment pointer. MAC and digest checks
//! run before any decryption, in constant time.
//!
//! File sizes are optionally obscured by padding to the next step of a 5%
//! geometric progression (minimum 541 bytes) before encryption.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 64;
pub const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// Ceiling for padded attachment plaintext.
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1000 * 1000;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("got invalid length attachment keys")]
    InvalidKey,
    #[error("got invalid length attachment")]
    InvalidLength,
    #[error("bad attachment MAC")]
    Mac,
    #[error("bad attachment digest")]
    Digest,
    #[error("attachment decryption failed")]
    Cipher,
    #[error("decrypted attachment size does not match expected size")]
    Size,
}

/// Output of [`encrypt_attachment`].
pub struct EncryptedAttachment {
    /// `iv ‖ ciphertext ‖ mac`.
    pub ciphertext: Vec<u8>,
    /// SHA-256 over the whole ciphertext blob.
    pub digest: [u8; 32],
    /// The random 64-byte pointer key (AES half ‖ MAC half).
    pub key: [u8; KEY_LEN],
}

/// Pad attachment data to the next size bucket of the 1.05-geometric
/// progression, never below 541 bytes and never beyond the attachment
/// ceiling.
pub fn add_attachment_padding(data: &[u8]) -> Vec<u8> {
    let original_len = data.len();
    let exponent = (original_len.max(1) as f64).log(1.05).ceil();
    let mut padded_size = 541usize.max(1.05f64.powf(exponent) as usize);
    if padded_size > MAX_ATTACHMENT_BYTES && original_len <= MAX_ATTACHMENT_BYTES {
        padded_size = MAX_ATTACHMENT_BYTES;
    }
    let mut out = data.to_vec();
    out.resize(padded_size.max(original_len), 0x00);
    out
}

/// Encrypt attachment bytes under a fresh random key and IV.
pub fn encrypt_attachment(data: &[u8], pad: bool) -> EncryptedAttachment {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let plaintext = if pad { add_attachment_padding(data) } else { data.to_vec() };
    let (ciphertext, digest) = encrypt_attachment_data(&plaintext, &key, &iv);
    EncryptedAttachment { ciphertext, digest, key }
}

/// Deterministic encryption core: returns the blob and its digest.
pub fn encrypt_attachment_data(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
) -> (Vec<u8>, [u8; 32]) {
    let (aes_key, mac_key) = key.split_at(32);

    let ciphertext = Aes256CbcEnc::new_from_slices(aes_key, iv)
        .expect("fixed key and iv sizes")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
    blob.extend_from_slice(iv);
    blob.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(mac_key).expect("mac key length fixed");
    mac.update(&blob);
    blob.extend_from_slice(&mac.finalize().into_bytes());

    let digest = Sha256::digest(&blob).into();
    (blob, digest)
}

/// Verify and decrypt an attachment blob.
///
/// `expected_size`, when known from the pointer, truncates the padded
/// plaintext back to the original length.
pub fn decrypt_attachment(
    blob: &[u8],
    key: &[u8],
    digest: &[u8],
    expected_size: Option<usize>,
) -> Result<Vec<u8>, AttachmentError> {
    let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| AttachmentError::InvalidKey)?;
    if blob.len() < IV_LEN + MAC_LEN {
        return Err(AttachmentError::InvalidLength);
    }
    let (aes_key, mac_key) = key.split_at(32);
    let (iv_and_ciphertext, mac) = blob.split_at(blob.len() - MAC_LEN);
    let (iv, ciphertext) = iv_and_ciphertext.split_at(IV_LEN);

    let mut expected_mac = HmacSha256::new_from_slice(mac_key).expect("mac key length fixed");
    expected_mac.update(iv_and_ciphertext);
    if !codec::ct_eq_prefix(&expected_mac.finalize().into_bytes(), mac) {
        return Err(AttachmentError::Mac);
    }

    let blob_digest: [u8; 32] = Sha256::digest(blob).into();
    if !codec::ct_eq_prefix(&blob_digest, digest) {
        return Err(AttachmentError::Digest);
    }

    let plaintext = Aes256CbcDec::new_from_slices(aes_key, iv)
        .expect("fixed key and iv sizes")
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AttachmentError::Cipher)?;

    match expected_size {
        Some(size) if size <= plaintext.len() => Ok(plaintext[..size].to_vec()),
        Some(_) => Err(AttachmentError::Size),
        None => Ok(plaintext),
    }
}
