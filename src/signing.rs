//! Request signing.
//!
//! Two signing regimes live here:
//!
//! * **Snode retrieve signing**: a plain Ed25519 signature over the ASCII
//!   string `method ‖ namespace ‖ timestamp` (namespace omitted when 0),
//!   submitted base64-encoded next to the hex `pubkeyEd25519`.
//! * **SOGS request signing**: community servers authenticate requests
//!   over `server_pk ‖ nonce ‖ timestamp ‖ method ‖ endpoint ‖
//!   blake2b(body)?`, either with the plain account key or *blinded*: a
//!   per-server scalar `k = reduce(blake2b64(server_pk))` multiplies the
//!   account's Curve25519 scalar `a`, and an Ed25519-shaped signature is
//!   produced under `kA`. The server only ever learns the pseudonym
//!   `"15" + hex(kA)`, so identities cannot be correlated across servers.

use blake2::{Blake2b512, Digest as _};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::Signer;
use rand::RngCore;
use sha2::{Digest as _, Sha512};
use thiserror::Error;

use crate::codec;
use crate::keys::KeyPair;
use crate::padding::PaddingScheme;

/// Pseudonym prefix of blinded ids.
pub const BLINDED_ID_PREFIX: &str = "15";
/// Prefix of unblinded Ed25519 ids in SOGS headers.
pub const UNBLINDED_ID_PREFIX: &str = "00";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid server public key")]
    InvalidServerKey,
}

// ─── Snode retrieve signing ──────────────────────────────────────────────────

/// Signature parameters attached to a signed snode sub-request.
#[derive(Debug, Clone)]
pub struct SnodeSignature {
    /// Base64 of the 64-byte Ed25519 signature.
    pub signature: String,
    /// Hex of the signing public key, submitted as `pubkeyEd25519`.
    pub pubkey_ed25519: String,
}

/// Sign a snode request. The namespace is part of the signed string only
/// when non-zero.
pub fn sign_snode_request(
    keypair: &KeyPair,
    method: &str,
    namespace: u32,
    timestamp_ms: u64,
) -> SnodeSignature {
    let message = if namespace == 0 {
        format!("{method}{timestamp_ms}")
    } else {
        format!("{method}{namespace}{timestamp_ms}")
    };
    let signature = keypair.ed25519.sign(message.as_bytes());
    SnodeSignature {
        signature: codec::bytes_to_base64(&signature.to_bytes()),
        pubkey_ed25519: hex::encode(keypair.ed25519_public().to_bytes()),
    }
}

// ─── SOGS signing ────────────────────────────────────────────────────────────

/// Per-server blinding values derived from the server public key.
pub struct BlindingValues {
    /// `ka = k·a mod ℓ`, the blinded secret scalar.
    pub secret: Scalar,
    /// `kA = [ka]B` compressed, the blinded public key.
    pub public: [u8; 32],
}

/// Derive the blinding values for `server_pk`.
pub fn blinding_values(server_pk: &[u8; 32], keypair: &KeyPair) -> BlindingValues {
    let k = reduce64(&Blake2b512::digest(server_pk));

    // the account's Curve25519 secret scalar: clamped SHA-512(seed)[0..32]
    let hash = Sha512::digest(keypair.ed25519.as_bytes());
    let mut a_bytes = [0u8; 32];
    a_bytes.copy_from_slice(&hash[..32]);
    a_bytes[0] &= 248;
    a_bytes[31] &= 127;
    a_bytes[31] |= 64;
    let a = Scalar::from_bytes_mod_order(a_bytes);

    let ka = k * a;
    let public = EdwardsPoint::mul_base(&ka).compress().to_bytes();
    BlindingValues { secret: ka, public }
}

/// The pseudonym this account presents to one server: `"15" + hex(kA)`.
pub fn blinded_session_id(keypair: &KeyPair, server_pk_hex: &str) -> Result<String, SigningError> {
    let server_pk = parse_server_pk(server_pk_hex)?;
    let blinding = blinding_values(&server_pk, keypair);
    Ok(format!("{BLINDED_ID_PREFIX}{}", hex::encode(blinding.public)))
}

/// Ed25519-shaped signature under the blinded key pair `(ka, kA)`.
///
/// The nonce is derived from the second half of `SHA-512(seed)` exactly as
/// the standard construction would, substituting `kA` for the public key.
pub fn blinded_ed25519_signature(
    message: &[u8],
    keypair: &KeyPair,
    blinding: &BlindingValues,
) -> [u8; 64] {
    let seed_hash = Sha512::digest(keypair.ed25519.as_bytes());
    let hrh = &seed_hash[32..];

    let r = reduce64(&sha512_parts(&[hrh, &blinding.public, message]));
    let big_r = EdwardsPoint::mul_base(&r).compress().to_bytes();

    let hram = reduce64(&sha512_parts(&[&big_r, &blinding.public, message]));
    let s = r + hram * blinding.secret;

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(&big_r);
    signature[32..].copy_from_slice(&s.to_bytes());
    signature
}

/// Sign a SOGS request, blinded or not.
///
/// The signed bytes are `server_pk ‖ nonce ‖ ASCII(timestamp) ‖ method ‖
/// endpoint`, plus `blake2b-64(body)` when a body is present.
#[allow(clippy::too_many_arguments)]
pub fn sign_sogs_request(
    keypair: &KeyPair,
    blind: bool,
    server_pk_hex: &str,
    timestamp_secs: u64,
    method: &str,
    endpoint: &str,
    nonce: &[u8; 16],
    body: Option<&[u8]>,
) -> Result<[u8; 64], SigningError> {
    let server_pk = parse_server_pk(server_pk_hex)?;

    let mut to_sign = Vec::new();
    to_sign.extend_from_slice(&server_pk);
    to_sign.extend_from_slice(nonce);
    to_sign.extend_from_slice(timestamp_secs.to_string().as_bytes());
    to_sign.extend_from_slice(method.as_bytes());
    to_sign.extend_from_slice(endpoint.as_bytes());
    if let Some(body) = body {
        to_sign.extend_from_slice(&Blake2b512::digest(body));
    }

    if blind {
        let blinding = blinding_values(&server_pk, keypair);
        Ok(blinded_ed25519_signature(&to_sign, keypair, &blinding))
    } else {
        Ok(keypair.ed25519.sign(&to_sign).to_bytes())
    }
}

/// Build the four `X-SOGS-*` headers for a request.
pub fn sogs_request_headers(
    keypair: &KeyPair,
    blind: bool,
    server_pk_hex: &str,
    method: &str,
    endpoint: &str,
    body: Option<&[u8]>,
) -> Result<Vec<(String, String)>, SigningError> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let signature = sign_sogs_request(
        keypair, blind, server_pk_hex, timestamp, method, endpoint, &nonce, body,
    )?;
    let pubkey = if blind {
        blinded_session_id(keypair, server_pk_hex)?
    } else {
        format!(
            "{UNBLINDED_ID_PREFIX}{}",
            hex::encode(keypair.ed25519_public().to_bytes())
        )
    };

    Ok(vec![
        ("X-SOGS-Pubkey".into(), pubkey),
        ("X-SOGS-Timestamp".into(), timestamp.to_string()),
        ("X-SOGS-Nonce".into(), codec::bytes_to_base64(&nonce)),
        ("X-SOGS-Signature".into(), codec::bytes_to_base64(&signature)),
    ])
}

/// Pad and sign a message for SOGS storage.
///
/// Returns the base64 padded data and base64 signature (blinded when
/// `blind` is set).
pub fn encode_sogs_message(
    keypair: &KeyPair,
    server_pk_hex: &str,
    message: &[u8],
    blind: bool,
) -> Result<(String, String), SigningError> {
    let padded = PaddingScheme::Terminator
        .add(message)
        .expect("terminator padding is infallible");
    let signature = if blind {
        let server_pk = parse_server_pk(server_pk_hex)?;
        let blinding = blinding_values(&server_pk, keypair);
        blinded_ed25519_signature(&padded, keypair, &blinding)
    } else {
        keypair.ed25519.sign(&padded).to_bytes()
    };
    Ok((codec::bytes_to_base64(&padded), codec::bytes_to_base64(&signature)))
}

// ─── helpers ─────────────────────────────────────────────────────────────────

fn parse_server_pk(server_pk_hex: &str) -> Result<[u8; 32], SigningError> {
    codec::hex_to_bytes(server_pk_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(SigningError::InvalidServerKey)
}

fn sha512_parts(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn reduce64(bytes: &[u8]) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(bytes);
    Scalar::from_bytes_mod_order_wide(&wide)
}
