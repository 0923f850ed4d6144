//! Checksum utilities for ingested files
//!
//! Every file the pipeline consumes is fingerprinted so the ledger can tell
//! two arrivals with the same name apart when inspecting history.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an in-memory payload
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_WORLD);
    }

    #[test]
    fn test_sha256_hex_distinguishes_payloads() {
        assert_ne!(sha256_hex(b"hello world"), sha256_hex(b"hello world "));
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
