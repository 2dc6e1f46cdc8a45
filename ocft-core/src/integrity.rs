//! Integrity: SHA-256 hex digests for chunks and whole files, verify on receive.

use sha2::{Digest, Sha256};

/// Hash a byte slice. Returns the lowercase hex SHA-256 digest.
pub fn hash_bytes(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Verify a chunk payload against the hex digest declared by the sender.
/// Comparison is case-insensitive; malformed hex never matches.
pub fn verify_chunk(payload: &[u8], expected_hex: &str) -> bool {
    hash_bytes(payload).eq_ignore_ascii_case(expected_hex.trim())
}

/// Incremental whole-file hasher, fed one block at a time.
#[derive(Default)]
pub struct FileHasher {
    inner: Sha256,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, block: &[u8]) {
        self.inner.update(block);
    }

    /// Finish and return the lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Compare a claimed secret against the expected one without short-circuiting on the first
/// differing byte.
pub fn secrets_match(claimed: &str, expected: &str) -> bool {
    let (a, b) = (claimed.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
