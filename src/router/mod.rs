// src/router/mod.rs
//! Message routing: envelope sealing/opening, the inbox queue, and the
//! observability counters paired with the boolean send contract.
//!
//! Outbound: encrypt to the recipient's public key, sign the ciphertext,
//! stamp the per-connection sequence. Inbound: verify the signature against
//! the handshake-authenticated sender document *before* decrypting; frames
//! that fail any check are dropped and counted, never delivered.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{NodeError, Result};
use crate::identity::key_management::{KeyManager, SealedPayload};
use crate::identity::IdentityManager;
use crate::models::did::DidDocument;
use crate::models::envelope::Envelope;

/// Builds a signed, encrypted envelope for a recipient.
///
/// # Process Flow
/// 1. ECIES-seal the plaintext to the recipient's public key
/// 2. Assemble routing fields and the sequence number
/// 3. ECDSA-sign the full signing payload with the sender's identity key
pub fn seal_envelope(
    identity: &IdentityManager,
    recipient: &DidDocument,
    plaintext: &str,
    sequence: u64,
) -> Result<Envelope> {
    let recipient_key = recipient.public_key()?;
    let sealed = KeyManager::seal(&recipient_key, plaintext.as_bytes())?;

    let mut envelope = Envelope {
        sender_did: identity.did().to_string(),
        recipient_did: recipient.id().to_string(),
        ephemeral_key: sealed.ephemeral_key,
        nonce: sealed.nonce,
        payload: sealed.ciphertext,
        signature: String::new(),
        sequence,
    };
    let signature = identity.sign(&envelope.signing_payload())?;
    envelope.signature = hex::encode(signature);
    Ok(envelope)
}

/// Verifies and decrypts an inbound envelope.
///
/// `sender` is the document authenticated during the connection handshake;
/// the envelope's claimed sender must match it, the recipient must be this
/// node, and the signature must verify — all before decryption.
///
/// # Errors
/// [`NodeError::Authentication`] for any verification failure (the caller
/// drops the envelope), [`NodeError::Crypto`] if decryption fails.
pub fn open_envelope(
    identity: &IdentityManager,
    sender: &DidDocument,
    envelope: &Envelope,
) -> Result<(String, String)> {
    if envelope.sender_did != sender.id() {
        return Err(NodeError::Authentication(format!(
            "envelope claims sender {} on a connection authenticated as {}",
            envelope.sender_did,
            sender.id()
        )));
    }
    if envelope.recipient_did != identity.did() {
        return Err(NodeError::Authentication(format!(
            "envelope addressed to {}, not this node",
            envelope.recipient_did
        )));
    }

    let signature = hex::decode(&envelope.signature)
        .map_err(|_| NodeError::Authentication("signature is not valid hex".to_string()))?;
    let sender_key = sender.public_key()?;
    if !KeyManager::verify_message(&sender_key, &envelope.signing_payload(), &signature) {
        return Err(NodeError::Authentication(
            "envelope signature does not verify".to_string(),
        ));
    }

    let sealed = SealedPayload {
        ephemeral_key: envelope.ephemeral_key.clone(),
        nonce: envelope.nonce.clone(),
        ciphertext: envelope.payload.clone(),
    };
    let plaintext_bytes = identity.open_sealed(&sealed)?;
    let plaintext = String::from_utf8(plaintext_bytes)
        .map_err(|_| NodeError::Crypto("plaintext is not valid UTF-8".to_string()))?;

    Ok((envelope.sender_did.clone(), plaintext))
}

/// Unbounded FIFO queue of verified, decrypted inbound messages.
///
/// Insertion order is arrival order; each item is handed to exactly one
/// receiver. Multiple concurrent receivers behave as general consumers of
/// the single queue.
pub struct Inbox {
    tx: mpsc::UnboundedSender<(String, String)>,
    rx: Mutex<mpsc::UnboundedReceiver<(String, String)>>,
}

impl Inbox {
    /// Creates an empty inbox.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Inbox {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Appends a delivered message. Called only after verification.
    pub fn push(&self, sender_did: String, plaintext: String) {
        // The receiver half lives as long as the inbox, so this cannot fail.
        let _ = self.tx.send((sender_did, plaintext));
    }

    /// Pops the next message in arrival order.
    ///
    /// Suspends until a message is available or the node stops; a pending
    /// `pop` fails with [`NodeError::NodeStopped`] within a bounded time
    /// after shutdown is signaled.
    pub async fn pop(&self, mut shutdown: watch::Receiver<bool>) -> Result<(String, String)> {
        if *shutdown.borrow() {
            return Err(NodeError::NodeStopped);
        }
        let mut rx = self.rx.lock().await;
        if *shutdown.borrow() {
            return Err(NodeError::NodeStopped);
        }
        tokio::select! {
            item = rx.recv() => item.ok_or(NodeError::NodeStopped),
            _ = shutdown.changed() => Err(NodeError::NodeStopped),
        }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal counters backing the boolean `send_message` contract.
///
/// The boolean deliberately hides failure causes; these counters (plus log
/// records) are the observable side channel.
#[derive(Default)]
pub struct NodeMetrics {
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    envelopes_dropped: AtomicU64,
    connections_opened: AtomicU64,
}

impl NodeMetrics {
    /// Records a confirmed transmission.
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a send that returned `false`.
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an inbound envelope dropped before delivery.
    pub fn record_dropped(&self) {
        self.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a handshake-completed connection registration.
    pub fn record_connection(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the node counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Envelopes accepted by the transport for transmission.
    pub messages_sent: u64,
    /// `send_message` calls that returned `false`.
    pub send_failures: u64,
    /// Inbound envelopes dropped by verification or replay checks.
    pub envelopes_dropped: u64,
    /// Connections registered after a successful handshake.
    pub connections_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn identity(port: u16) -> IdentityManager {
        IdentityManager::generate(&NodeConfig::new("localhost", port, "/ws")).unwrap()
    }

    #[test]
    fn test_seal_open_round_trip() {
        let alice = identity(9301);
        let bob = identity(9302);

        let envelope = seal_envelope(&alice, bob.document(), "ping", 1).unwrap();
        let (sender, plaintext) = open_envelope(&bob, alice.document(), &envelope).unwrap();

        assert_eq!(sender, alice.did());
        assert_eq!(plaintext, "ping");
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let alice = identity(9303);
        let bob = identity(9304);

        let mut envelope = seal_envelope(&alice, bob.document(), "ping", 1).unwrap();
        // Flip one signature byte.
        let mut signature = hex::decode(&envelope.signature).unwrap();
        signature[0] ^= 0x01;
        envelope.signature = hex::encode(signature);

        match open_envelope(&bob, alice.document(), &envelope) {
            Err(NodeError::Authentication(_)) => {}
            other => panic!("expected Authentication, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let alice = identity(9305);
        let bob = identity(9306);

        let mut envelope = seal_envelope(&alice, bob.document(), "ping", 1).unwrap();
        let mut payload = base64::decode(&envelope.payload).unwrap();
        payload[0] ^= 0x01;
        envelope.payload = base64::encode(payload);

        // Signature covers the ciphertext, so this fails at verification,
        // not decryption.
        assert!(matches!(
            open_envelope(&bob, alice.document(), &envelope),
            Err(NodeError::Authentication(_))
        ));
    }

    #[test]
    fn test_impersonated_sender_rejected() {
        let alice = identity(9307);
        let bob = identity(9308);
        let mallory = identity(9309);

        // Mallory seals an envelope but the connection is authenticated as
        // Alice; the sender check must reject it.
        let envelope = seal_envelope(&mallory, bob.document(), "ping", 1).unwrap();
        assert!(matches!(
            open_envelope(&bob, alice.document(), &envelope),
            Err(NodeError::Authentication(_))
        ));
    }

    #[test]
    fn test_misaddressed_envelope_rejected() {
        let alice = identity(9310);
        let bob = identity(9311);
        let carol = identity(9312);

        let envelope = seal_envelope(&alice, bob.document(), "ping", 1).unwrap();
        // Carol receives an envelope addressed to Bob.
        assert!(matches!(
            open_envelope(&carol, alice.document(), &envelope),
            Err(NodeError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_inbox_fifo_order() {
        let inbox = Inbox::new();
        let (_tx, shutdown) = watch::channel(false);

        inbox.push("did:node:a".to_string(), "first".to_string());
        inbox.push("did:node:b".to_string(), "second".to_string());

        let (_, first) = inbox.pop(shutdown.clone()).await.unwrap();
        let (_, second) = inbox.pop(shutdown).await.unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");
    }

    #[tokio::test]
    async fn test_inbox_pop_fails_after_shutdown() {
        let inbox = Inbox::new();
        let (tx, shutdown) = watch::channel(false);

        let pending = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { inbox.pop(shutdown).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), pending)
            .await
            .expect("pop must not hang after stop")
            .unwrap();
        assert!(matches!(result, Err(NodeError::NodeStopped)));
    }
}
