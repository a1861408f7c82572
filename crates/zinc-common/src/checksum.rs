//! Checksum and hashing helpers
//!
//! Entries carry CRC32C checksums; access keys are compared by their
//! SHA-256 digest so that only hashes are ever stored in configuration.

use sha2::{Digest, Sha256};

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Lowercase hex SHA-256 of a secret (access keys, master key)
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Whether `key` looks like an access key: exactly 32 hex characters
#[must_use]
pub fn is_valid_access_key(key: &str) -> bool {
    key.len() == 32 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_verification() {
        let data = b"hello, world!";
        let one_shot = compute_crc32c(data);
        assert!(verify_crc32c(data, one_shot));
        assert!(!verify_crc32c(b"hello, world?", one_shot));
    }

    #[test]
    fn test_crc32c_is_castagnoli() {
        // IEEE CRC32 of the same input is 0xCBF43926
        assert_eq!(compute_crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_hash_secret() {
        let hash = hash_secret("0123456789abcdef0123456789abcdef");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_secret("0123456789abcdef0123456789abcdef"));
        assert_ne!(hash, hash_secret("0123456789abcdef0123456789abcdee"));
    }

    #[test]
    fn test_access_key_shape() {
        assert!(is_valid_access_key("0123456789abcdef0123456789ABCDEF"));
        assert!(!is_valid_access_key("0123456789abcdef"));
        assert!(!is_valid_access_key("0123456789abcdef0123456789abcdeg"));
    }
}
