// src/utils/crypto.rs
//! Hashing utilities shared by signing, DID derivation, and envelope
//! integrity checks.
//!
//! Uses SHA-256 for all operations.

use sha2::{Digest, Sha256};

/// Computes a SHA-256 hash of the input data.
///
/// # Arguments
/// * `data` - Binary data to hash (as bytes slice)
///
/// # Returns
/// Fixed-size 32-byte array (`[u8; 32]`) containing the hash.
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_data(b"hello world"), hash_data(b"hello world"));
        assert_ne!(hash_data(b"hello world"), hash_data(b"hello worlds"));
    }
}
