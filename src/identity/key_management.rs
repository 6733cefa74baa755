// src/identity/key_management.rs
//! Cryptographic key management for the node identity.
//!
//! Provides secure generation and usage of cryptographic keys for:
//! - Digital signatures (envelope and document authentication)
//! - End-to-end payload encryption (ECIES-style sealing)
//!
//! Uses the following cryptographic primitives:
//! - secp256k1 curve (via `k256` crate) for ECDSA and ECDH
//! - SHA-256 hashing and HKDF key derivation
//! - XChaCha20-Poly1305 authenticated encryption
//! - Cryptographically secure random number generation

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use k256::ecdh::{diffie_hellman, EphemeralSecret, SharedSecret};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{NodeError, Result};
use crate::utils::crypto::hash_data;

/// XChaCha20 nonce length in bytes.
const NONCE_SIZE: usize = 24;

/// HKDF info string binding derived keys to envelope encryption.
const ENVELOPE_KEY_INFO: &[u8] = b"did-node/envelope/v1";

/// An ECIES-sealed payload: everything the recipient needs to decrypt,
/// minus their own private key.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    /// Hex-encoded compressed ephemeral public key.
    pub ephemeral_key: String,
    /// Base64-encoded 24-byte nonce.
    pub nonce: String,
    /// Base64-encoded ciphertext with authentication tag.
    pub ciphertext: String,
}

/// Secure key management for the node's secp256k1 keypair.
///
/// This struct provides:
/// - Secure key generation using the system RNG
/// - ECDSA signing over SHA-256 prehashes (deterministic, RFC 6979)
/// - Signature verification against arbitrary public keys
/// - ECIES-style sealing/opening of payloads for a recipient key
///
/// # Security Notes
/// - The secret key is never exposed outside export for caller persistence
/// - The keypair is read-only after construction
#[derive(Clone)]
pub struct KeyManager {
    /// Securely stored private key (never exposed).
    secret_key: SecretKey,
    /// Derived public key for verification.
    public_key: PublicKey,
}

impl KeyManager {
    /// Generates a new KeyManager with a fresh secp256k1 keypair.
    ///
    /// # Errors
    /// Returns [`NodeError::Crypto`] if the system RNG fails.
    pub fn generate() -> Result<Self> {
        let secret_key = SecretKey::random(&mut OsRng);
        let public_key = secret_key.public_key();
        Ok(KeyManager {
            secret_key,
            public_key,
        })
    }

    /// Reconstructs a KeyManager from a hex-encoded private key scalar.
    ///
    /// # Errors
    /// Returns [`NodeError::Crypto`] if the hex does not decode to a valid
    /// secp256k1 secret key.
    pub fn from_private_key_hex(private_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(private_key_hex)
            .map_err(|_| NodeError::Crypto("private key is not valid hex".to_string()))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|_| NodeError::Crypto("invalid secp256k1 private key".to_string()))?;
        let public_key = secret_key.public_key();
        Ok(KeyManager {
            secret_key,
            public_key,
        })
    }

    /// Hex-encoded private key scalar, for caller-side persistence.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.to_bytes())
    }

    /// The public half of the keypair.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Hex-encoded compressed SEC1 public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.to_encoded_point(true).as_bytes())
    }

    /// Signs a message using ECDSA (secp256k1) with SHA-256 prehashing.
    ///
    /// # Arguments
    /// * `message` - Raw message bytes to sign
    ///
    /// # Returns
    /// 64-byte compact ECDSA signature (R || S values)
    ///
    /// # Security
    /// - Uses deterministic ECDSA (RFC 6979)
    /// - Prehashing prevents malleability across message lengths
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = hash_data(message);
        let signing_key = SigningKey::from(&self.secret_key);
        let signature: Signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| NodeError::Crypto(format!("signing failed: {}", e)))?;
        Ok(signature.to_vec())
    }

    /// Verifies an ECDSA signature against a public key.
    ///
    /// Deterministic given its inputs: malformed signatures simply verify
    /// as `false`, they never error.
    pub fn verify_message(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
        let signature = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let digest = hash_data(message);
        let verifying_key = VerifyingKey::from(public_key);
        verifying_key.verify_prehash(&digest, &signature).is_ok()
    }

    /// Seals a plaintext for a recipient public key.
    ///
    /// # Process Flow
    /// 1. Generate an ephemeral secp256k1 keypair
    /// 2. ECDH with the recipient's static public key
    /// 3. HKDF-SHA256 expand into a 32-byte encryption key
    /// 4. XChaCha20-Poly1305 encrypt under a random 24-byte nonce
    ///
    /// The ephemeral key is discarded after use, so only the recipient's
    /// private key can recover the shared secret.
    pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<SealedPayload> {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let ephemeral_public = ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(recipient);
        let key = derive_envelope_key(&shared)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| NodeError::Crypto("envelope encryption failed".to_string()))?;

        Ok(SealedPayload {
            ephemeral_key: hex::encode(ephemeral_public.to_encoded_point(true).as_bytes()),
            nonce: base64::encode(nonce),
            ciphertext: base64::encode(ciphertext),
        })
    }

    /// Opens a sealed payload addressed to this keypair.
    ///
    /// # Errors
    /// Returns [`NodeError::Crypto`] if the ephemeral key or nonce are
    /// malformed, or if the authentication tag does not verify (tampered or
    /// misaddressed ciphertext).
    pub fn open(&self, sealed: &SealedPayload) -> Result<Vec<u8>> {
        let ephemeral_bytes = hex::decode(&sealed.ephemeral_key)
            .map_err(|_| NodeError::Crypto("ephemeral key is not valid hex".to_string()))?;
        let ephemeral = PublicKey::from_sec1_bytes(&ephemeral_bytes)
            .map_err(|_| NodeError::Crypto("invalid ephemeral public key".to_string()))?;

        let shared = diffie_hellman(self.secret_key.to_nonzero_scalar(), ephemeral.as_affine());
        let key = derive_envelope_key(&shared)?;

        let nonce_bytes = base64::decode(&sealed.nonce)
            .map_err(|_| NodeError::Crypto("nonce is not valid base64".to_string()))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(NodeError::Crypto(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext = base64::decode(&sealed.ciphertext)
            .map_err(|_| NodeError::Crypto("ciphertext is not valid base64".to_string()))?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| NodeError::Crypto("envelope decryption failed".to_string()))
    }
}

/// Derives the symmetric envelope key from an ECDH shared secret.
fn derive_envelope_key(shared: &SharedSecret) -> Result<[u8; 32]> {
    let hkdf = shared.extract::<Sha256>(None);
    let mut key = [0u8; 32];
    hkdf.expand(ENVELOPE_KEY_INFO, &mut key)
        .map_err(|_| NodeError::Crypto("key derivation failed".to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let key_manager = KeyManager::generate().unwrap();
        let message = b"arbitrary message";

        let signature = key_manager.sign_message(message).unwrap();
        assert!(KeyManager::verify_message(
            key_manager.public_key(),
            message,
            &signature
        ));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let signer = KeyManager::generate().unwrap();
        let other = KeyManager::generate().unwrap();
        let message = b"arbitrary message";

        let signature = signer.sign_message(message).unwrap();
        assert!(!KeyManager::verify_message(
            other.public_key(),
            message,
            &signature
        ));
    }

    #[test]
    fn test_malformed_signature_fails_quietly() {
        let key_manager = KeyManager::generate().unwrap();
        assert!(!KeyManager::verify_message(
            key_manager.public_key(),
            b"msg",
            &[0u8; 10]
        ));
    }

    #[test]
    fn test_private_key_hex_round_trip() {
        let key_manager = KeyManager::generate().unwrap();
        let restored = KeyManager::from_private_key_hex(&key_manager.private_key_hex()).unwrap();

        assert_eq!(key_manager.public_key_hex(), restored.public_key_hex());

        // Restored key signs messages the original public key accepts.
        let signature = restored.sign_message(b"check").unwrap();
        assert!(KeyManager::verify_message(
            key_manager.public_key(),
            b"check",
            &signature
        ));
    }

    #[test]
    fn test_seal_open_round_trip() {
        let recipient = KeyManager::generate().unwrap();
        let plaintext = b"confidential payload";

        let sealed = KeyManager::seal(recipient.public_key(), plaintext).unwrap();
        let opened = recipient.open(&sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let recipient = KeyManager::generate().unwrap();
        let sealed = KeyManager::seal(recipient.public_key(), b"payload").unwrap();

        let mut bytes = base64::decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        let tampered = SealedPayload {
            ciphertext: base64::encode(bytes),
            ..sealed
        };

        assert!(recipient.open(&tampered).is_err());
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let recipient = KeyManager::generate().unwrap();
        let eavesdropper = KeyManager::generate().unwrap();

        let sealed = KeyManager::seal(recipient.public_key(), b"payload").unwrap();
        assert!(eavesdropper.open(&sealed).is_err());
    }
}
