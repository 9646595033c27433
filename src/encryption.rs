//! End-to-end message encryption.
//!
//! # One-to-one (SESSION_MESSAGE)
//!
//! 1. Pad the plaintext (see [`crate::padding`]).
//! 2. Sign `padded ‖ sender_ed_pub ‖ recipient_x_pub` with the sender's
//!    Ed25519 key, binding the message to both identities without the
//!    sender encrypting anything under their own long-term key.
//! 3. Seal `padded ‖ sender_ed_pub ‖ signature` to the recipient's X25519
//!    key with a NaCl sealed box (fresh ephemeral key per message), so the
//!    ciphertext alone reveals nothing about the sender: deniable to
//!    everyone except the recipient, who verifies the inner signature.
//!
//! # Closed group (CLOSED_GROUP_MESSAGE)
//!
//! The group id doubles as the hex of a 32-byte pre-shared key. The
//! payload `sender_ed_pub ‖ signature ‖ padded` is secretbox-encrypted
//! under that key, nonce prepended. Receivers hold a keyring (one key per
//! group epoch) and accept the first key that decrypts and verifies.
//!
//! In both directions the sender identity handed back to the caller is the
//! hex X25519 key converted from the authenticated Ed25519 key.

use crypto_box::aead::OsRng;
use crypto_secretbox::aead::{Aead, AeadCore, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use thiserror::Error;

use crate::codec;
use crate::envelope::EnvelopeType;
use crate::keys::{ed25519_pubkey_to_x25519, KeyPair};
use crate::padding::{PaddingError, PaddingScheme};

/// Pre-shared closed-group key, one per group epoch.
pub type GroupKey = [u8; 32];

const ED_PUB_LEN: usize = 32;
const SIG_LEN: usize = 64;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error(transparent)]
    Padding(#[from] PaddingError),
    #[error("sealing failed")]
    Sealed,
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("could not open message box")]
    Box,
    #[error("invalid message signature")]
    Signature,
    #[error(transparent)]
    Padding(#[from] PaddingError),
    #[error("unknown envelope type {0}")]
    UnknownType(i32),
}

/// Result of [`encrypt`].
pub struct EncryptResult {
    pub envelope_type: EnvelopeType,
    pub ciphertext: Vec<u8>,
}

/// Result of [`decrypt`]: the plaintext and the authenticated sender.
pub struct DecryptedMessage {
    pub plaintext: Vec<u8>,
    /// Hex X25519 public key of the sender (no `05` prefix).
    pub sender: String,
}

/// Encrypt a plaintext for `recipient` under the given envelope type.
///
/// For [`EnvelopeType::SessionMessage`], `recipient` is a session id (the
/// `05` prefix is optional). For [`EnvelopeType::ClosedGroupMessage`] it is
/// the hex of the 32-byte group key.
pub fn encrypt(
    sender: &KeyPair,
    recipient: &str,
    plaintext: &[u8],
    envelope_type: EnvelopeType,
    padding: PaddingScheme,
) -> Result<EncryptResult, EncryptError> {
    let padded = padding.add(plaintext)?;
    let ciphertext = match envelope_type {
        EnvelopeType::SessionMessage => {
            let recipient_pub = recipient_x25519(recipient)?;
            encrypt_session_protocol(sender, &recipient_pub, &padded)?
        }
        EnvelopeType::ClosedGroupMessage => {
            let key = group_key_from_hex(recipient)
                .ok_or_else(|| EncryptError::InvalidRecipient(recipient.into()))?;
            encrypt_for_group(sender, &key, &padded)?
        }
    };
    Ok(EncryptResult { envelope_type, ciphertext })
}

/// Decrypt a ciphertext addressed to us.
///
/// `group_keys` is consulted only for closed-group envelopes.
pub fn decrypt(
    recipient: &KeyPair,
    ciphertext: &[u8],
    envelope_type: EnvelopeType,
    group_keys: &[GroupKey],
    padding: PaddingScheme,
) -> Result<DecryptedMessage, DecryptError> {
    match envelope_type {
        EnvelopeType::SessionMessage => {
            decrypt_session_protocol(recipient, ciphertext, padding)
        }
        EnvelopeType::ClosedGroupMessage => {
            decrypt_for_group(ciphertext, group_keys, padding)
        }
    }
}

// ─── One-to-one ──────────────────────────────────────────────────────────────

fn encrypt_session_protocol(
    sender: &KeyPair,
    recipient_pub: &[u8; 32],
    padded: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let ed_pub = sender.ed25519_public().to_bytes();

    let verification = [padded, ed_pub.as_slice(), recipient_pub.as_slice()].concat();
    let signature = sender.ed25519.sign(&verification);

    let inner = [padded, ed_pub.as_slice(), signature.to_bytes().as_slice()].concat();

    let recipient_key = crypto_box::PublicKey::from(*recipient_pub);
    recipient_key.seal(&mut OsRng, &inner).map_err(|_| EncryptError::Sealed)
}

fn decrypt_session_protocol(
    recipient: &KeyPair,
    ciphertext: &[u8],
    padding: PaddingScheme,
) -> Result<DecryptedMessage, DecryptError> {
    let secret = crypto_box::SecretKey::from(recipient.x25519_secret.to_bytes());
    let inner = secret.unseal(ciphertext).map_err(|_| DecryptError::Box)?;

    if inner.len() <= ED_PUB_LEN + SIG_LEN {
        return Err(DecryptError::Box);
    }
    let (rest, sig_bytes) = inner.split_at(inner.len() - SIG_LEN);
    let (padded, ed_pub) = rest.split_at(rest.len() - ED_PUB_LEN);

    let verification =
        [padded, ed_pub, recipient.x25519_public.as_bytes().as_slice()].concat();
    verify_detached(ed_pub, &verification, sig_bytes)?;

    let sender = sender_identity(ed_pub)?;
    let plaintext = padding.remove(padded)?;
    Ok(DecryptedMessage { plaintext, sender })
}

// ─── Closed group ────────────────────────────────────────────────────────────

fn encrypt_for_group(
    sender: &KeyPair,
    key: &GroupKey,
    padded: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let ed_pub = sender.ed25519_public().to_bytes();
    let signature = sender.ed25519.sign(padded);
    let payload = [ed_pub.as_slice(), signature.to_bytes().as_slice(), padded].concat();

    let cipher = XSalsa20Poly1305::new(key.into());
    let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
    let boxed = cipher
        .encrypt(&nonce, payload.as_slice())
        .map_err(|_| EncryptError::Sealed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + boxed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&boxed);
    Ok(out)
}

fn decrypt_for_group(
    ciphertext: &[u8],
    keys: &[GroupKey],
    padding: PaddingScheme,
) -> Result<DecryptedMessage, DecryptError> {
    if ciphertext.len() <= NONCE_LEN {
        return Err(DecryptError::Box);
    }
    let (nonce, boxed) = ciphertext.split_at(NONCE_LEN);

    for key in keys {
        let cipher = XSalsa20Poly1305::new(key.into());
        let Ok(payload) = cipher.decrypt(Nonce::from_slice(nonce), boxed) else {
            continue;
        };
        if payload.len() <= ED_PUB_LEN + SIG_LEN {
            continue;
        }
        let (ed_pub, rest) = payload.split_at(ED_PUB_LEN);
        let (sig_bytes, padded) = rest.split_at(SIG_LEN);

        verify_detached(ed_pub, padded, sig_bytes)?;
        let sender = sender_identity(ed_pub)?;
        let plaintext = padding.remove(padded)?;
        return Ok(DecryptedMessage { plaintext, sender });
    }
    Err(DecryptError::Box)
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

fn verify_detached(ed_pub: &[u8], message: &[u8], sig: &[u8]) -> Result<(), DecryptError> {
    let ed_pub: [u8; 32] = ed_pub.try_into().map_err(|_| DecryptError::Signature)?;
    let sig: [u8; 64] = sig.try_into().map_err(|_| DecryptError::Signature)?;
    let verifying = VerifyingKey::from_bytes(&ed_pub).map_err(|_| DecryptError::Signature)?;
    verifying
        .verify(message, &Signature::from_bytes(&sig))
        .map_err(|_| DecryptError::Signature)
}

fn sender_identity(ed_pub: &[u8]) -> Result<String, DecryptError> {
    let ed_pub: [u8; 32] = ed_pub.try_into().map_err(|_| DecryptError::Signature)?;
    let x_pub = ed25519_pubkey_to_x25519(&ed_pub).map_err(|_| DecryptError::Signature)?;
    Ok(hex::encode(x_pub.as_bytes()))
}

fn recipient_x25519(recipient: &str) -> Result<[u8; 32], EncryptError> {
    let stripped = codec::strip_prefix_str(recipient);
    let bytes = codec::hex_to_bytes(stripped)
        .map_err(|_| EncryptError::InvalidRecipient(recipient.into()))?;
    bytes
        .try_into()
        .map_err(|_| EncryptError::InvalidRecipient(recipient.into()))
}

/// Parse a closed-group id into its 32-byte key.
pub fn group_key_from_hex(group_id: &str) -> Option<GroupKey> {
    let bytes = codec::hex_to_bytes(group_id).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    const PADDING: PaddingScheme = PaddingScheme::Terminator;

    #[test]
    fn one_to_one_roundtrip_recovers_plaintext_and_sender() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let plaintext = b"hello world";

        let encrypted = encrypt(
            &alice,
            &bob.session_id(),
            plaintext,
            EnvelopeType::SessionMessage,
            PADDING,
        )
        .unwrap();
        assert_eq!(encrypted.envelope_type, EnvelopeType::SessionMessage);

        let decrypted = decrypt(
            &bob,
            &encrypted.ciphertext,
            EnvelopeType::SessionMessage,
            &[],
            PADDING,
        )
        .unwrap();
        assert_eq!(decrypted.plaintext, plaintext);
        assert_eq!(decrypted.sender, hex::encode(alice.x25519_public.as_bytes()));
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mallory = KeyPair::generate();

        let encrypted = encrypt(
            &alice,
            &bob.session_id(),
            b"secret",
            EnvelopeType::SessionMessage,
            PADDING,
        )
        .unwrap();

        assert!(matches!(
            decrypt(&mallory, &encrypted.ciphertext, EnvelopeType::SessionMessage, &[], PADDING),
            Err(DecryptError::Box)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let mut encrypted = encrypt(
            &alice,
            &bob.session_id(),
            b"secret",
            EnvelopeType::SessionMessage,
            PADDING,
        )
        .unwrap()
        .ciphertext;
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;

        assert!(decrypt(&bob, &encrypted, EnvelopeType::SessionMessage, &[], PADDING).is_err());
    }

    #[test]
    fn group_roundtrip() {
        let sender = KeyPair::generate();
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let group_id = hex::encode(key);

        let encrypted = encrypt(
            &sender,
            &group_id,
            b"group hi",
            EnvelopeType::ClosedGroupMessage,
            PADDING,
        )
        .unwrap();

        let decrypted = decrypt(
            &KeyPair::generate(),
            &encrypted.ciphertext,
            EnvelopeType::ClosedGroupMessage,
            &[key],
            PADDING,
        )
        .unwrap();
        assert_eq!(decrypted.plaintext, b"group hi");
        assert_eq!(decrypted.sender, hex::encode(sender.x25519_public.as_bytes()));
    }

    #[test]
    fn group_keyring_tries_all_epochs() {
        let sender = KeyPair::generate();
        let mut old_key = [0u8; 32];
        let mut current_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut old_key);
        rand::rngs::OsRng.fill_bytes(&mut current_key);

        let encrypted = encrypt(
            &sender,
            &hex::encode(old_key),
            b"from an old epoch",
            EnvelopeType::ClosedGroupMessage,
            PADDING,
        )
        .unwrap();

        // keyring order should not matter
        let decrypted = decrypt(
            &KeyPair::generate(),
            &encrypted.ciphertext,
            EnvelopeType::ClosedGroupMessage,
            &[current_key, old_key],
            PADDING,
        )
        .unwrap();
        assert_eq!(decrypted.plaintext, b"from an old epoch");
    }

    #[test]
    fn group_unknown_key_fails() {
        let sender = KeyPair::generate();
        let mut key = [0u8; 32];
        let mut other = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut other);

        let encrypted = encrypt(
            &sender,
            &hex::encode(key),
            b"msg",
            EnvelopeType::ClosedGroupMessage,
            PADDING,
        )
        .unwrap();

        assert!(matches!(
            decrypt(
                &KeyPair::generate(),
                &encrypted.ciphertext,
                EnvelopeType::ClosedGroupMessage,
                &[other],
                PADDING,
            ),
            Err(DecryptError::Box)
        ));
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        let alice = KeyPair::generate();
        assert!(matches!(
            encrypt(&alice, "not hex", b"x", EnvelopeType::SessionMessage, PADDING),
            Err(EncryptError::InvalidRecipient(_))
        ));
        assert!(matches!(
            encrypt(&alice, "abcd", b"x", EnvelopeType::ClosedGroupMessage, PADDING),
            Err(EncryptError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn block_aligned_scheme_roundtrips_too() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let scheme = PaddingScheme::BlockAligned;

        let encrypted = encrypt(
            &alice,
            &bob.session_id(),
            b"other deployment",
            EnvelopeType::SessionMessage,
            scheme,
        )
        .unwrap();
        let decrypted = decrypt(
            &bob,
            &encrypted.ciphertext,
            EnvelopeType::SessionMessage,
            &[],
            scheme,
        )
        .unwrap();
        assert_eq!(decrypted.plaintext, b"other deployment");
    }
}
