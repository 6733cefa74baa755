// src/models/envelope.rs
//! Wire messages exchanged between authenticated peers.
//!
//! Every WebSocket text frame carries exactly one [`WireFrame`] as JSON, so
//! the transport's native message boundaries give envelope atomicity for
//! free. Frames are FIFO within a single connection; no ordering holds
//! across connections.

use serde::{Deserialize, Serialize};

/// One signed, end-to-end encrypted message unit.
///
/// The payload is ECIES-encrypted to the recipient's static public key
/// (ephemeral ECDH → HKDF-SHA256 → XChaCha20-Poly1305) and the signature is
/// computed by the sender over the *ciphertext* plus routing context, so
/// receivers verify before doing any decryption work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// DID of the sending node.
    pub sender_did: String,
    /// DID of the receiving node.
    pub recipient_did: String,
    /// Hex-encoded compressed ephemeral public key used for ECDH.
    pub ephemeral_key: String,
    /// Base64-encoded 24-byte XChaCha20 nonce.
    pub nonce: String,
    /// Base64-encoded ciphertext (includes the Poly1305 tag).
    pub payload: String,
    /// Hex-encoded ECDSA signature over [`Envelope::signing_payload`].
    pub signature: String,
    /// Monotonically increasing per-connection sequence number.
    pub sequence: u64,
}

impl Envelope {
    /// Bytes covered by the envelope signature.
    ///
    /// Covers every field except the signature itself, so tampering with
    /// routing fields, the sequence, or the ciphertext is detectable.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.sender_did,
            self.recipient_did,
            self.sequence,
            self.ephemeral_key,
            self.nonce,
            self.payload
        )
        .into_bytes()
    }
}

/// Frames of the node-to-node protocol.
///
/// The handshake is a three-way mutual proof-of-possession exchange:
/// `Hello` (initiator) → `HelloAck` (responder) → `HelloFin` (initiator).
/// After both proofs verify, the connection is established and only
/// `Envelope` and `Bye` frames are expected.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "data")]
pub enum WireFrame {
    /// Handshake opener: the initiator's DID Document and a fresh challenge.
    Hello {
        /// Initiator's DID Document as JSON.
        document: String,
        /// Hex-encoded random challenge the responder must sign.
        challenge: String,
    },
    /// Responder's document, counter-challenge, and proof over the
    /// initiator's challenge.
    HelloAck {
        /// Responder's DID Document as JSON.
        document: String,
        /// Hex-encoded random challenge the initiator must sign.
        challenge: String,
        /// Hex-encoded signature proving possession of the responder's key.
        proof: String,
    },
    /// Initiator's proof over the responder's challenge.
    HelloFin {
        /// Hex-encoded signature proving possession of the initiator's key.
        proof: String,
    },
    /// A routed message.
    Envelope(Envelope),
    /// Graceful close notification.
    Bye,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            sender_did: "did:node:aaaa".to_string(),
            recipient_did: "did:node:bbbb".to_string(),
            ephemeral_key: "02ab".to_string(),
            nonce: "bm9uY2U=".to_string(),
            payload: "Y2lwaGVydGV4dA==".to_string(),
            signature: "00ff".to_string(),
            sequence: 7,
        }
    }

    #[test]
    fn test_wire_frame_round_trip() {
        let frames = vec![
            WireFrame::Hello {
                document: "{}".to_string(),
                challenge: "aabb".to_string(),
            },
            WireFrame::HelloAck {
                document: "{}".to_string(),
                challenge: "ccdd".to_string(),
                proof: "eeff".to_string(),
            },
            WireFrame::HelloFin {
                proof: "0011".to_string(),
            },
            WireFrame::Envelope(sample_envelope()),
            WireFrame::Bye,
        ];

        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let _: WireFrame = serde_json::from_str(&json).unwrap();
        }
    }

    #[test]
    fn test_signing_payload_covers_routing_fields() {
        let envelope = sample_envelope();
        let mut modified = envelope.clone();
        modified.sequence = 8;
        assert_ne!(envelope.signing_payload(), modified.signing_payload());

        let mut modified = envelope.clone();
        modified.recipient_did = "did:node:cccc".to_string();
        assert_ne!(envelope.signing_payload(), modified.signing_payload());
    }
}
