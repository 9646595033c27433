//! Length-hiding message padding.
//!
//! Two schemes exist among deployed clients; which one is on the wire
//! depends on the peer generation, so both are provided and the caller
//! picks one per deployment.
//!
//! * [`PaddingScheme::Terminator`]: append `0x80`, then zeros up to a
//!   multiple of 160. The current wire format.
//! * [`PaddingScheme::BlockAligned`]: prefix the plaintext with its
//!   big-endian u16 length, then pad with random bytes to a size bucket
//!   (16/32/64/128/256 depending on length); an aligned message still
//!   gains one full block.

use rand::RngCore;
use thiserror::Error;

/// Terminator-scheme part size.
const PART_SIZE: usize = 160;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaddingError {
    #[error("invalid message padding")]
    Invalid,
    #[error("message too long for length-prefixed padding")]
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingScheme {
    /// `0x80` terminator + zeros to a multiple of 160.
    #[default]
    Terminator,
    /// u16 length prefix + random bytes to the next size bucket.
    BlockAligned,
}

impl PaddingScheme {
    pub fn add(&self, plaintext: &[u8]) -> Result<Vec<u8>, PaddingError> {
        match self {
            PaddingScheme::Terminator => Ok(add_terminator_padding(plaintext)),
            PaddingScheme::BlockAligned => add_block_padding(plaintext),
        }
    }

    pub fn remove(&self, padded: &[u8]) -> Result<Vec<u8>, PaddingError> {
        match self {
            PaddingScheme::Terminator => remove_terminator_padding(padded),
            PaddingScheme::BlockAligned => remove_block_padding(padded),
        }
    }
}

/// Append `0x80` and zero bytes until the length is a multiple of 160.
pub fn add_terminator_padding(message: &[u8]) -> Vec<u8> {
    let padded_len = padded_message_length(message.len());
    let mut out = vec![0u8; padded_len];
    out[..message.len()].copy_from_slice(message);
    out[message.len()] = 0x80;
    out
}

/// Strip terminator padding.
///
/// Scans from the end: zeros are padding, the first non-zero byte must be
/// the `0x80` terminator. A buffer without any terminator is returned
/// unchanged (some peers send unpadded plaintext); an all-zero buffer is
/// invalid.
pub fn remove_terminator_padding(padded: &[u8]) -> Result<Vec<u8>, PaddingError> {
    for (i, &value) in padded.iter().enumerate().rev() {
        if value == 0x80 {
            return Ok(padded[..i].to_vec());
        }
        if value != 0x00 {
            log::debug!("message without terminator padding, passing through");
            return Ok(padded.to_vec());
        }
    }
    Err(PaddingError::Invalid)
}

fn padded_message_length(message_len: usize) -> usize {
    let with_terminator = message_len + 1;
    let mut parts = with_terminator / PART_SIZE;
    if with_terminator % PART_SIZE != 0 {
        parts += 1;
    }
    parts * PART_SIZE
}

fn block_size(len: usize) -> usize {
    match len {
        0..=127 => 16,
        128..=255 => 32,
        256..=511 => 64,
        512..=1023 => 128,
        _ => 256,
    }
}

/// Length-prefix the plaintext and pad with random bytes to the bucket
/// boundary; an already-aligned message gains a whole extra block.
pub fn add_block_padding(message: &[u8]) -> Result<Vec<u8>, PaddingError> {
    let len = u16::try_from(message.len()).map_err(|_| PaddingError::TooLong)?;
    let mut out = Vec::with_capacity(message.len() + 2 + 256);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(message);

    let block = block_size(out.len());
    let mut pad_len = (block - out.len() % block) % block;
    if pad_len == 0 {
        pad_len = block;
    }
    let mut padding = vec![0u8; pad_len];
    rand::rngs::OsRng.fill_bytes(&mut padding);
    out.extend_from_slice(&padding);
    Ok(out)
}

/// Recover a block-padded plaintext via its length prefix.
pub fn remove_block_padding(padded: &[u8]) -> Result<Vec<u8>, PaddingError> {
    if padded.len() < 2 {
        return Err(PaddingError::Invalid);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if padded.len() < 2 + len {
        return Err(PaddingError::Invalid);
    }
    Ok(padded[2..2 + len].to_vec())
}
