//! SHA256 digest utilities for content addressing
//!
//! This module provides the [`Digest`] content address used for manifests and
//! blobs, plus an incremental [`DigestHasher`] for verifying streamed bytes.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;

/// Standard SHA256 digest for empty blobs
pub const EMPTY_BLOB_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const SHA256_PREFIX: &str = "sha256:";

/// A validated `sha256:<hex>` content address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of a byte slice
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hex part without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated form for log output
    pub fn short(&self) -> &str {
        &self.0[..std::cmp::min(self.0.len(), 19)]
    }

    fn is_valid_sha256_hex(hex: &str) -> bool {
        hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl FromStr for Digest {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
            ReplicationError::InvalidDigest(format!("missing sha256: prefix: {}", s))
        })?;

        if !Self::is_valid_sha256_hex(hex_part) {
            return Err(ReplicationError::InvalidDigest(format!(
                "expected 64 lowercase hex characters: {}",
                s
            )));
        }

        Ok(Digest(s.to_string()))
    }
}

impl TryFrom<String> for Digest {
    type Error = ReplicationError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Incremental SHA256 over streamed chunks
#[derive(Debug, Clone, Default)]
pub struct DigestHasher {
    hasher: sha2::Sha256,
    bytes: u64,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Digest {
        Digest(format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.finalize())))
    }

    /// Finish hashing and compare against the declared digest
    pub fn verify(self, expected: &Digest) -> Result<()> {
        let actual = self.finalize();
        if &actual != expected {
            return Err(ReplicationError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}
