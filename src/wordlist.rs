//! The 1626-word English mnemonic word list.
//!
//! Words are matched by their first three characters, which are unique
//! across the list. The list is embedded at build time and parsed once.

use once_cell::sync::Lazy;

/// Number of words in the list; also the base of the mnemonic encoding.
pub const WORD_COUNT: usize = 1626;

/// Length of the unique word prefix used for lookups.
pub const PREFIX_LEN: usize = 3;

static RAW: &str = include_str!("english.txt");

/// The word list in encoding order.
pub static WORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let words: Vec<&'static str> = RAW.split_ascii_whitespace().collect();
    debug_assert_eq!(words.len(), WORD_COUNT);
    words
});

/// Find the index of a word by its first [`PREFIX_LEN`] characters.
pub fn index_of(word: &str) -> Option<usize> {
    let prefix = truncated(word);
    WORDS.iter().position(|w| truncated(w) == prefix)
}

/// A word's lookup prefix (whole word when shorter than [`PREFIX_LEN`]).
pub fn truncated(word: &str) -> &str {
    if word.len() > PREFIX_LEN {
        &word[..PREFIX_LEN]
    } else {
        word
    }
}
