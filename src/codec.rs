//! Byte/string helpers shared across the crate: hex and base64 codecs,
//! session-id prefix stripping and constant-time digest comparison.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use subtle::ConstantTimeEq;

/// Convert bytes to a lowercase hex string.
pub fn bytes_to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode a hex string into bytes.
pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s)
}

pub fn bytes_to_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn base64_to_bytes(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(s)
}

/// Strip the leading `05` from a session id, if present.
///
/// Session ids are `"05" + hex(x25519 pub)`; the raw X25519 key is what the
/// crypto layer wants.
pub fn strip_prefix_str(session_id: &str) -> &str {
    if session_id.len() == 66 && session_id.starts_with("05") {
        &session_id[2..]
    } else {
        session_id
    }
}

/// Strip a leading `0x05` byte from a 33-byte key, if present.
pub fn strip_prefix_bytes(key: &[u8]) -> &[u8] {
    if key.len() == 33 && key[0] == 0x05 {
        &key[1..]
    } else {
        key
    }
}

/// True if `s` is non-empty, even-length and all hex digits.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Constant-time equality for MACs and digests.
///
/// `expected` may be a truncation of `computed`; only the leading
/// `expected.len()` bytes are compared, like the reference clients do.
pub fn ct_eq_prefix(computed: &[u8], expected: &[u8]) -> bool {
    if expected.is_empty() || computed.len() < expected.len() {
        return false;
    }
    computed[..expected.len()].ct_eq(expected).into()
}
