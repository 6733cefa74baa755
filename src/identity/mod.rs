// src/identity/mod.rs
//! Identity management: keypairs, DID derivation, and the node identity
//! lifecycle.

pub mod key_management;
pub mod manager;

pub use key_management::KeyManager;
pub use manager::IdentityManager;
