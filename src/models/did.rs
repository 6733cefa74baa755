// src/models/did.rs
//! Decentralized Identifier (DID) data model implementation.
//!
//! Defines the validated structure for DID Documents loosely following the
//! [DID Core Specification](https://www.w3.org/TR/did-core/).
//!
//! A `DidDocument` can only be obtained through a constructor that has
//! verified it: either [`DidDocument::build`], which self-signs a fresh
//! document, or [`DidDocument::parse`], which checks the deterministic
//! DID derivation and the embedded proof. Invalid documents are therefore
//! unrepresentable downstream of this module.

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};
use crate::identity::key_management::KeyManager;
use crate::utils::crypto::hash_data;
use crate::utils::serialization::{deserialize, serialize};

/// Service type advertised for the node's messaging endpoint.
pub const MESSAGING_SERVICE_TYPE: &str = "DidMessaging";

/// DID method prefix used by this crate.
pub const DID_METHOD_PREFIX: &str = "did:node:";

/// Derives a DID deterministically from a public key.
///
/// # DID Format
/// ```text
/// did:node:<hex(sha256(compressed-sec1-public-key))[..40]>
/// ```
///
/// The derivation is stable: the same public key always produces the same
/// DID, and document validation recomputes it to reject documents whose `id`
/// does not match their key material.
pub fn derive_did(public_key: &PublicKey) -> String {
    let compressed = public_key.to_encoded_point(true);
    let digest = hash_data(compressed.as_bytes());
    format!("{}{}", DID_METHOD_PREFIX, hex::encode(&digest[..20]))
}

/// A service entry pointing at an endpoint of the DID subject.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    /// Service type tag, e.g. `"DidMessaging"`.
    #[serde(rename = "type")]
    pub service_type: String,
    /// Endpoint URI, e.g. `"ws://localhost:8001/ws"`.
    pub service_endpoint: String,
}

/// Proof block carrying the issuer's self-signature.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Hex-encoded ECDSA signature over the document's signing input.
    pub signature: String,
}

/// A DID Document representing a decentralized identity.
///
/// Contains the cryptographic material and service endpoint necessary to
/// authenticate and reach the DID subject.
///
/// # Wire format
/// ```json
/// {
///   "id": "did:node:4f2a...",
///   "publicKey": "<hex compressed secp256k1 key>",
///   "service": [{"type": "DidMessaging", "serviceEndpoint": "ws://host:port/path"}],
///   "proof": {"signature": "<hex>"}
/// }
/// ```
///
/// # Invariants
/// - `id` equals the deterministic derivation from `publicKey`
/// - `proof.signature` verifies under `publicKey`
/// - at least one service entry with a `ws://` or `wss://` endpoint exists
///
/// Documents are immutable once constructed; caches replace them, never
/// edit them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// The complete DID string identifier.
    id: String,
    /// Hex-encoded compressed SEC1 public key.
    public_key: String,
    /// Service endpoints of the DID subject.
    service: Vec<ServiceEntry>,
    /// Self-signature of the issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    proof: Option<Proof>,
}

impl DidDocument {
    /// Builds and self-signs a document for the given key and endpoint.
    ///
    /// # Errors
    /// Returns [`NodeError::Crypto`] if signing fails.
    pub(crate) fn build(key_manager: &KeyManager, endpoint: &str) -> Result<Self> {
        let public_key_hex = key_manager.public_key_hex();
        let id = derive_did(key_manager.public_key());
        let signing_input = Self::signing_input(&id, &public_key_hex, endpoint);
        let signature = key_manager.sign_message(&signing_input)?;

        Ok(DidDocument {
            id,
            public_key: public_key_hex,
            service: vec![ServiceEntry {
                service_type: MESSAGING_SERVICE_TYPE.to_string(),
                service_endpoint: endpoint.to_string(),
            }],
            proof: Some(Proof {
                signature: hex::encode(signature),
            }),
        })
    }

    /// Parses a document from JSON and verifies it.
    ///
    /// # Validation steps
    /// 1. JSON parses into the document structure
    /// 2. `publicKey` decodes to a valid secp256k1 point
    /// 3. `id` matches the deterministic derivation from `publicKey`
    /// 4. a messaging service endpoint is present
    /// 5. `proof.signature` (if present) verifies under `publicKey`
    ///
    /// # Errors
    /// Returns [`NodeError::DocumentInvalid`] describing the first failed
    /// check. A failed document is never partially usable.
    pub fn parse(json: &str) -> Result<Self> {
        let document: DidDocument = deserialize(json)
            .map_err(|e| NodeError::DocumentInvalid(format!("malformed JSON: {}", e)))?;
        document.validate()?;
        Ok(document)
    }

    fn validate(&self) -> Result<()> {
        let public_key = self.public_key()?;

        let derived = derive_did(&public_key);
        if derived != self.id {
            return Err(NodeError::DocumentInvalid(format!(
                "id {} does not match key-derived DID {}",
                self.id, derived
            )));
        }

        let endpoint = self
            .service
            .iter()
            .find(|s| {
                s.service_endpoint.starts_with("ws://") || s.service_endpoint.starts_with("wss://")
            })
            .map(|s| s.service_endpoint.clone())
            .ok_or_else(|| {
                NodeError::DocumentInvalid("no WebSocket service endpoint".to_string())
            })?;

        if let Some(proof) = &self.proof {
            let signature = hex::decode(&proof.signature).map_err(|_| {
                NodeError::DocumentInvalid("proof signature is not valid hex".to_string())
            })?;
            let signing_input = Self::signing_input(&self.id, &self.public_key, &endpoint);
            if !KeyManager::verify_message(&public_key, &signing_input, &signature) {
                return Err(NodeError::DocumentInvalid(
                    "proof signature does not verify".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Bytes covered by the document's self-signature.
    fn signing_input(id: &str, public_key_hex: &str, endpoint: &str) -> Vec<u8> {
        format!("{}|{}|{}", id, public_key_hex, endpoint).into_bytes()
    }

    /// The DID string identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hex-encoded compressed public key.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key
    }

    /// Decodes the embedded public key.
    pub fn public_key(&self) -> Result<PublicKey> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|_| NodeError::DocumentInvalid("publicKey is not valid hex".to_string()))?;
        PublicKey::from_sec1_bytes(&bytes).map_err(|_| {
            NodeError::DocumentInvalid("publicKey is not a valid secp256k1 point".to_string())
        })
    }

    /// The WebSocket endpoint this DID can be reached at.
    ///
    /// Present on every validated document (enforced by the constructors).
    pub fn messaging_endpoint(&self) -> &str {
        self.service
            .iter()
            .find(|s| {
                s.service_endpoint.starts_with("ws://") || s.service_endpoint.starts_with("wss://")
            })
            .map(|s| s.service_endpoint.as_str())
            .unwrap_or_default()
    }

    /// Serializes the document to its wire JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serialize(self)?)
    }
}
