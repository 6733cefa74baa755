// src/models/mod.rs
//! Data structures: DID Documents and wire messages.

pub mod did;
pub mod envelope;
