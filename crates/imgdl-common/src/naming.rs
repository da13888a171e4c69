//! Content-addressed naming for encoded images
//!
//! A record's identity is the BLAKE2b hash (16-byte digest) of its final
//! encoded bytes, independent of the URL it came from.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b128 = Blake2b<U16>;

/// Length of a content hash in hex characters (128-bit digest)
pub const CONTENT_HASH_HEX_LEN: usize = 32;

/// Hex-encoded BLAKE2b-128 digest of an image payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash the given bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Blake2b128::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
