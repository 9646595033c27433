//! Mnemonic phrases for account recovery.
//!
//! Not BIP-39: this is the 1626-word scheme where every three words encode
//! one little-endian u32 and a 13th word carries a CRC32 checksum. Words
//! are recognised by their first three characters only.
//!
//! Decoding of a group `(w1, w2, w3)`:
//!
//!   x = w1 + n·((n − w1 + w2) mod n) + n²·((n − w2 + w3) mod n),  n = 1626
//!
//! with the consistency requirement `x mod n == w1`. Encoding is the exact
//! inverse, so freshly generated phrases decode back to the drawn entropy.

use rand::RngCore;
use thiserror::Error;

use crate::wordlist::{self, PREFIX_LEN, WORDS, WORD_COUNT};

/// Bytes of entropy carried by the 12 data words.
pub const ENTROPY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum MnemonicError {
    #[error("invalid number of words in mnemonic: {0}")]
    WordCount(usize),
    #[error("unknown mnemonic word: {0}")]
    UnknownWord(String),
    #[error("couldn't decode mnemonic")]
    Decode,
}

/// Decode a 12- or 13-word phrase into its 16 entropy bytes.
///
/// A failing checksum word is reported with a warning but does not fail the
/// decode; the deployed clients accept such phrases.
pub fn decode_mnemonic(mnemonic: &str) -> Result<[u8; ENTROPY_LEN], MnemonicError> {
    let mut words: Vec<&str> = mnemonic.split_whitespace().collect();

    if words.len() < 12 || words.len() % 3 == 2 {
        return Err(MnemonicError::WordCount(words.len()));
    }

    let checksum_word = if words.len() % 3 == 1 {
        words.pop()
    } else {
        None
    };
    if words.len() != 12 {
        return Err(MnemonicError::WordCount(words.len() + usize::from(checksum_word.is_some())));
    }

    let n = WORD_COUNT as u64;
    let mut out = [0u8; ENTROPY_LEN];
    for (chunk, dst) in words.chunks(3).zip(out.chunks_mut(4)) {
        let w1 = index_of(chunk[0])? as u64;
        let w2 = index_of(chunk[1])? as u64;
        let w3 = index_of(chunk[2])? as u64;

        let x = w1 + n * ((n - w1 + w2) % n) + n * n * ((n - w2 + w3) % n);
        if x % n != w1 || x > u32::MAX as u64 {
            return Err(MnemonicError::Decode);
        }
        dst.copy_from_slice(&(x as u32).to_le_bytes());
    }

    if let Some(checksum) = checksum_word {
        let expected = WORDS[checksum_index(&words)];
        if wordlist::truncated(expected) != wordlist::truncated(checksum) {
            log::warn!(
                "mnemonic checksum mismatch (expected a word like {expected:?}), proceeding"
            );
        }
    }

    Ok(out)
}

/// Decode a phrase and right-pad the entropy to the 32-byte account seed.
pub fn mnemonic_to_seed(mnemonic: &str) -> Result<[u8; 32], MnemonicError> {
    let entropy = decode_mnemonic(mnemonic)?;
    let mut seed = [0u8; 32];
    seed[..ENTROPY_LEN].copy_from_slice(&entropy);
    Ok(seed)
}

/// Encode 16 entropy bytes as 12 words plus the checksum word.
pub fn encode_mnemonic(entropy: &[u8; ENTROPY_LEN]) -> String {
    let n = WORD_COUNT as u32;
    let mut words: Vec<&str> = Vec::with_capacity(13);
    for chunk in entropy.chunks(4) {
        let x = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let w1 = x % n;
        let w2 = (x / n + w1) % n;
        let w3 = (x / (n * n) + w2) % n;
        words.push(WORDS[w1 as usize]);
        words.push(WORDS[w2 as usize]);
        words.push(WORDS[w3 as usize]);
    }
    words.push(WORDS[checksum_index(&words)]);
    words.join(" ")
}

/// Generate a fresh 13-word mnemonic from OS randomness.
pub fn generate_mnemonic() -> String {
    let mut entropy = [0u8; ENTROPY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    encode_mnemonic(&entropy)
}

/// Checksum word index: CRC32 over the concatenated word prefixes.
fn checksum_index(words: &[&str]) -> usize {
    let trimmed: String = words.iter().map(|w| wordlist::truncated(w)).collect();
    crc32fast::hash(trimmed.as_bytes()) as usize % WORD_COUNT
}

fn index_of(word: &str) -> Result<usize, MnemonicError> {
    if word.len() < PREFIX_LEN {
        return Err(MnemonicError::UnknownWord(word.to_string()));
    }
    wordlist::index_of(word).ok_or_else(|| MnemonicError::UnknownWord(word.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_mnemonic_has_13_words() {
        let phrase = generate_mnemonic();
        assert_eq!(phrase.split_whitespace().count(), 13);
    }

    #[test]
    fn encode_decode_is_identity() {
        for _ in 0..32 {
            let mut entropy = [0u8; ENTROPY_LEN];
            rand::rngs::OsRng.fill_bytes(&mut entropy);
            let phrase = encode_mnemonic(&entropy);
            assert_eq!(decode_mnemonic(&phrase).unwrap(), entropy);
        }
    }

    #[test]
    fn generated_checksum_word_is_consistent() {
        let phrase = generate_mnemonic();
        let words: Vec<&str> = phrase.split_whitespace().collect();
        let expected = WORDS[checksum_index(&words[..12])];
        assert_eq!(
            crate::wordlist::truncated(expected),
            crate::wordlist::truncated(words[12])
        );
    }

    #[test]
    fn seed_is_entropy_zero_padded() {
        let phrase = generate_mnemonic();
        let entropy = decode_mnemonic(&phrase).unwrap();
        let seed = mnemonic_to_seed(&phrase).unwrap();
        assert_eq!(&seed[..16], &entropy);
        assert_eq!(&seed[16..], &[0u8; 16]);
    }

    #[test]
    fn rejects_wrong_word_count() {
        assert!(matches!(
            decode_mnemonic("only three words"),
            Err(MnemonicError::WordCount(3))
        ));
        // 14 words is 3k+2 with a checksum, always malformed
        let phrase = ["session"; 14].join(" ");
        assert!(matches!(
            decode_mnemonic(&phrase),
            Err(MnemonicError::WordCount(14))
        ));
    }

    #[test]
    fn rejects_unknown_word() {
        let mut words = vec!["session"; 12];
        words[4] = "qqqqq";
        assert!(matches!(
            decode_mnemonic(&words.join(" ")),
            Err(MnemonicError::UnknownWord(w)) if w == "qqqqq"
        ));
    }

    #[test]
    fn twelve_words_decode_without_checksum() {
        let phrase = ["session"; 12].join(" ");
        assert!(decode_mnemonic(&phrase).is_ok());
    }
}
