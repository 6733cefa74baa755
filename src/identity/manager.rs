// src/identity/manager.rs
//! Node identity lifecycle: generation, loading, and export.
//!
//! An identity is the triple `(private_key_hex, did, did_document_json)`.
//! Exactly one identity exists per node; it is created once (generated or
//! loaded) and is immutable for the node's lifetime. The private key never
//! leaves this module except through [`IdentityManager::export`] for
//! caller-side persistence — the core performs no file I/O itself.

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::identity::key_management::{KeyManager, SealedPayload};
use crate::models::did::DidDocument;

/// The node's own identity: keypair, DID, and self-signed DID Document.
pub struct IdentityManager {
    did: String,
    key_manager: KeyManager,
    document: DidDocument,
    document_json: String,
}

impl IdentityManager {
    /// Generates a fresh identity advertising the configured endpoint.
    ///
    /// Creates a keypair, derives the DID deterministically from the public
    /// key, and builds a self-signed DID Document embedding
    /// `ws://{host_domain}:{host_port}{host_ws_path}`.
    ///
    /// # Errors
    /// Returns [`NodeError::Crypto`] if key generation or signing fails.
    pub fn generate(config: &NodeConfig) -> Result<Self> {
        let key_manager = KeyManager::generate()?;
        let document = DidDocument::build(&key_manager, &config.advertised_endpoint())?;
        let document_json = document.to_json()?;
        Ok(IdentityManager {
            did: document.id().to_string(),
            key_manager,
            document,
            document_json,
        })
    }

    /// Installs an externally supplied identity triple.
    ///
    /// # Validation
    /// - `did_document_json` must parse and pass document verification
    /// - the document's `id` must equal `did`
    /// - the embedded public key must be consistent with `private_key_hex`,
    ///   checked by a sign/verify round trip
    ///
    /// # Errors
    /// - [`NodeError::DocumentInvalid`] if the document fails verification
    /// - [`NodeError::IdentityMismatch`] on any inconsistency between the
    ///   three parts; never silently repaired
    pub fn load(private_key_hex: &str, did: &str, did_document_json: &str) -> Result<Self> {
        let key_manager = KeyManager::from_private_key_hex(private_key_hex)?;
        let document = DidDocument::parse(did_document_json)?;

        if document.id() != did {
            return Err(NodeError::IdentityMismatch(format!(
                "document id {} does not match supplied DID {}",
                document.id(),
                did
            )));
        }
        if document.public_key_hex() != key_manager.public_key_hex() {
            return Err(NodeError::IdentityMismatch(
                "document public key does not match private key".to_string(),
            ));
        }

        // Sign/verify round trip proves the private key actually controls
        // the published public key.
        let probe = key_manager.sign_message(b"identity-consistency-check")?;
        let public_key = document.public_key()?;
        if !KeyManager::verify_message(&public_key, b"identity-consistency-check", &probe) {
            return Err(NodeError::IdentityMismatch(
                "private key cannot produce signatures valid under the document key".to_string(),
            ));
        }

        Ok(IdentityManager {
            did: did.to_string(),
            key_manager,
            document,
            document_json: did_document_json.to_string(),
        })
    }

    /// Exports the identity triple for caller-side persistence.
    ///
    /// Round-trip guarantee: feeding the exact returned triple back into
    /// [`IdentityManager::load`] reproduces an identity whose DID and
    /// signing behavior are indistinguishable from this one.
    pub fn export(&self) -> (String, String, String) {
        (
            self.key_manager.private_key_hex(),
            self.did.clone(),
            self.document_json.clone(),
        )
    }

    /// This node's DID.
    pub fn did(&self) -> &str {
        &self.did
    }

    /// This node's validated DID Document.
    pub fn document(&self) -> &DidDocument {
        &self.document
    }

    /// The DID Document as wire JSON.
    pub fn document_json(&self) -> &str {
        &self.document_json
    }

    /// Signs arbitrary bytes with the identity key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.key_manager.sign_message(message)
    }

    /// Opens an ECIES payload sealed to this identity's public key.
    pub fn open_sealed(&self, sealed: &SealedPayload) -> Result<Vec<u8>> {
        self.key_manager.open(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NodeConfig {
        NodeConfig::new("localhost", 9100, "/ws")
    }

    #[test]
    fn test_generate_load_round_trip() {
        let original = IdentityManager::generate(&test_config()).unwrap();
        let (private_key, did, document_json) = original.export();

        let restored = IdentityManager::load(&private_key, &did, &document_json).unwrap();
        assert_eq!(restored.did(), original.did());

        // Signing behavior is indistinguishable: signatures from the
        // restored identity verify under the original document key.
        let signature = restored.sign(b"message").unwrap();
        let public_key = original.document().public_key().unwrap();
        assert!(KeyManager::verify_message(&public_key, b"message", &signature));
    }

    #[test]
    fn test_load_rejects_mismatched_did() {
        let identity = IdentityManager::generate(&test_config()).unwrap();
        let (private_key, _, document_json) = identity.export();

        let result = IdentityManager::load(
            &private_key,
            "did:node:ffffffffffffffffffffffffffffffffffffffff",
            &document_json,
        );
        match result {
            Err(NodeError::IdentityMismatch(_)) => {}
            other => panic!("expected IdentityMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_load_rejects_foreign_private_key() {
        let identity = IdentityManager::generate(&test_config()).unwrap();
        let (_, did, document_json) = identity.export();

        let foreign = IdentityManager::generate(&test_config()).unwrap();
        let (foreign_key, _, _) = foreign.export();

        let result = IdentityManager::load(&foreign_key, &did, &document_json);
        match result {
            Err(NodeError::IdentityMismatch(_)) => {}
            other => panic!("expected IdentityMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_load_rejects_garbage_document() {
        let identity = IdentityManager::generate(&test_config()).unwrap();
        let (private_key, did, _) = identity.export();

        assert!(IdentityManager::load(&private_key, &did, "not json").is_err());
    }

    #[test]
    fn test_document_advertises_configured_endpoint() {
        let identity = IdentityManager::generate(&test_config()).unwrap();
        assert_eq!(
            identity.document().messaging_endpoint(),
            "ws://localhost:9100/ws"
        );
    }
}
