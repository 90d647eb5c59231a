//! Content addressing.
//!
//! Blocks are identified across edits by a SHA-256 digest of their exact
//! text. The only normalisation applied is CRLF -> LF, so a file that went
//! through a Windows editor does not look wholesale modified.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` hex digits, for display.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentHash {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub fn hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    let mut rest = bytes;
    while let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") {
        hasher.update(&rest[..pos]);
        rest = &rest[pos + 1..];
    }
    hasher.update(rest);
    ContentHash(hex::encode(hasher.finalize()))
}

pub fn hash_str(text: &str) -> ContentHash {
    hash(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_str("abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_crlf_normalised() {
        assert_eq!(hash_str("a\r\nb"), hash_str("a\nb"));
        assert_ne!(hash_str("a\rb"), hash_str("a\nb"));
    }

    #[test]
    fn test_single_byte_change_changes_hash() {
        assert_ne!(hash_str("Hello world."), hash_str("Hello world!"));
        assert_ne!(hash_str("Hello world."), hash_str("Hello world. "));
    }

    #[test]
    fn test_short_prefix() {
        let digest = hash_str("abc");
        assert_eq!(digest.short(8), "ba7816bf");
        assert_eq!(digest.short(1000).len(), 64);
    }
}
