//! AnyValue Common
//!
//! Shared utilities for the AnyValue serializer crates.
//!
//! This crate provides:
//! - Component-based structured logging with an instance id context
//! - DNS-safe compact ID generation for public keys

pub mod logging;

pub use logging::{Component, Logger};

/// Utility module for compact ID encoding
pub mod compact_ids {
    use data_encoding::BASE32HEX_NOPAD;
    use sha2::{Digest, Sha256};

    /// Generate a DNS-safe compact ID from public key bytes using SHA-256 hash.
    /// - Input: SEC1/X9.63 uncompressed (65 bytes)
    /// - Truncate: first 16 bytes of SHA-256 hash
    /// - Encode: Base32hex (no padding), lowercase (26 chars)
    pub fn compact_id(public_key: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        let hash_result = hasher.finalize();

        let compact_hash = &hash_result[..16];
        BASE32HEX_NOPAD.encode(compact_hash).to_lowercase()
    }

    #[cfg(test)]
    mod tests {
        use super::compact_id;

        #[test]
        fn compact_id_is_stable_and_dns_safe() {
            let a = compact_id(&[4u8; 65]);
            let b = compact_id(&[4u8; 65]);
            assert_eq!(a, b);
            assert_eq!(a.len(), 26);
            assert!(a
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='v').contains(&c)));
        }

        #[test]
        fn compact_id_differs_per_key() {
            assert_ne!(compact_id(&[1, 2, 3]), compact_id(&[1, 2, 4]));
        }
    }
}
