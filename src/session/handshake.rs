// src/session/handshake.rs
//! Mutual-authentication handshake.
//!
//! Three-way exchange establishing an authenticated connection between two
//! DIDs. Each side presents its DID Document and proves possession of the
//! private key behind it by signing the other side's fresh challenge:
//!
//! ```text
//! initiator                                 responder
//!   Hello { doc_i, c_i }            ──────────▶
//!            ◀──────────  HelloAck { doc_r, c_r, sign_r(c_i | did_r) }
//!   HelloFin { sign_i(c_r | did_i) } ──────────▶
//! ```
//!
//! Documents are fully validated (derivation + self-signature) before any
//! proof is checked. A failed handshake leaves the peer untrusted; the
//! connection is discarded, never upgraded.

use rand::RngCore;

use crate::error::{NodeError, Result};
use crate::identity::key_management::KeyManager;
use crate::identity::IdentityManager;
use crate::models::did::DidDocument;
use crate::models::envelope::WireFrame;
use crate::transport::{self, WsStream};

/// Generates a 32-byte hex challenge.
fn fresh_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Bytes a proof signature covers: the challenge bound to the prover's DID.
fn proof_input(challenge: &str, prover_did: &str) -> Vec<u8> {
    format!("{}|{}", challenge, prover_did).into_bytes()
}

fn parse_peer_document(json: &str) -> Result<DidDocument> {
    DidDocument::parse(json)
        .map_err(|e| NodeError::Authentication(format!("peer document rejected: {}", e)))
}

fn verify_proof(document: &DidDocument, challenge: &str, proof_hex: &str) -> Result<()> {
    let proof = hex::decode(proof_hex)
        .map_err(|_| NodeError::Authentication("proof is not valid hex".to_string()))?;
    let public_key = document.public_key()?;
    if !KeyManager::verify_message(&public_key, &proof_input(challenge, document.id()), &proof) {
        return Err(NodeError::Authentication(format!(
            "{} failed proof of key possession",
            document.id()
        )));
    }
    Ok(())
}

async fn expect_frame(ws: &mut WsStream) -> Result<WireFrame> {
    transport::next_frame(ws)
        .await?
        .ok_or_else(|| NodeError::Authentication("peer closed during handshake".to_string()))
}

/// Runs the handshake in the initiator role.
///
/// `expected_did` is the DID the connection was dialed for; a peer
/// presenting any other identity is rejected.
///
/// Returns the peer's authenticated document on success.
pub async fn initiate(
    ws: &mut WsStream,
    identity: &IdentityManager,
    expected_did: &str,
) -> Result<DidDocument> {
    let challenge = fresh_challenge();
    transport::send_frame(
        ws,
        &WireFrame::Hello {
            document: identity.document_json().to_string(),
            challenge: challenge.clone(),
        },
    )
    .await?;

    let (document_json, peer_challenge, proof) = match expect_frame(ws).await? {
        WireFrame::HelloAck {
            document,
            challenge,
            proof,
        } => (document, challenge, proof),
        _ => {
            return Err(NodeError::Authentication(
                "expected HelloAck from responder".to_string(),
            ))
        }
    };

    let document = parse_peer_document(&document_json)?;
    if document.id() != expected_did {
        return Err(NodeError::Authentication(format!(
            "dialed {} but peer identifies as {}",
            expected_did,
            document.id()
        )));
    }
    verify_proof(&document, &challenge, &proof)?;

    let own_proof = identity.sign(&proof_input(&peer_challenge, identity.did()))?;
    transport::send_frame(
        ws,
        &WireFrame::HelloFin {
            proof: hex::encode(own_proof),
        },
    )
    .await?;

    Ok(document)
}

/// Runs the handshake in the acceptor role.
///
/// The initiator's identity is not known in advance; whatever document it
/// presents is validated and then proven.
pub async fn respond(ws: &mut WsStream, identity: &IdentityManager) -> Result<DidDocument> {
    let (document_json, peer_challenge) = match expect_frame(ws).await? {
        WireFrame::Hello {
            document,
            challenge,
        } => (document, challenge),
        _ => {
            return Err(NodeError::Authentication(
                "expected Hello from initiator".to_string(),
            ))
        }
    };

    let document = parse_peer_document(&document_json)?;

    let challenge = fresh_challenge();
    let own_proof = identity.sign(&proof_input(&peer_challenge, identity.did()))?;
    transport::send_frame(
        ws,
        &WireFrame::HelloAck {
            document: identity.document_json().to_string(),
            challenge: challenge.clone(),
            proof: hex::encode(own_proof),
        },
    )
    .await?;

    let proof = match expect_frame(ws).await? {
        WireFrame::HelloFin { proof } => proof,
        _ => {
            return Err(NodeError::Authentication(
                "expected HelloFin from initiator".to_string(),
            ))
        }
    };
    verify_proof(&document, &challenge, &proof)?;

    Ok(document)
}
