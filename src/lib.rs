// src/lib.rs

//! # DID Messaging Node
//!
//! A point-to-point messaging node identified by a self-sovereign
//! Decentralized Identifier (DID). Each node owns a secp256k1 keypair,
//! publishes a self-signed DID Document binding its identity to a WebSocket
//! endpoint, and exchanges end-to-end encrypted, signed envelopes with other
//! DID-identified nodes.
//!
//! ## Architecture Overview
//! 1. **Identity Layer**: key generation, DID derivation, document signing
//! 2. **Resolution Layer**: DID → DID Document lookup (cache + pluggable backend)
//! 3. **Transport Layer**: WebSocket listener and outbound dialer
//! 4. **Session Layer**: authenticated connection registry (one per remote DID)
//! 5. **Routing Layer**: envelope encryption/verification and the inbox queue
//!
//! ## Quick Start
//! ```rust,no_run
//! use did_node::{NodeConfig, SimpleNode};
//!
//! # async fn example() -> did_node::Result<()> {
//! let node = SimpleNode::new(NodeConfig::new("localhost", 8001, "/ws"));
//! let (private_key, did, document) = node.generate_did_document()?;
//! node.set_did_info(&private_key, &did, &document)?;
//! node.run().await?;
//!
//! let (sender, text) = node.receive_message().await?;
//! println!("{} says: {}", sender, text);
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod identity; // Key management and identity lifecycle
pub mod models; // DID Documents and wire messages
pub mod resolver; // DID → document resolution
pub mod router; // Envelope sealing/opening and the inbox
pub mod session; // Authenticated connection registry
pub mod transport; // WebSocket listener and dialer
pub mod utils; // Hashing and serialization helpers

mod node;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use models::did::DidDocument;
pub use node::{MetricsSnapshot, SimpleNode};
pub use resolver::{HttpResolver, ResolutionBackend};
