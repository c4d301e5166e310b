//! Checksum utilities for landed object verification

use crate::error::{EpcError, Result};
use sha2::{Digest, Sha256};

/// SHA-256 of an in-memory buffer, hex encoded
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify that `data` hashes to `expected`
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(EpcError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_SHA256);
    }

    #[test]
    fn test_verify_checksum_mismatch() {
        assert!(verify_checksum(b"hello world", HELLO_SHA256).is_ok());
        let err = verify_checksum(b"hello", HELLO_SHA256).unwrap_err();
        assert!(matches!(err, EpcError::ChecksumMismatch { .. }));
    }
}
