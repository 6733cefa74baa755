// src/resolver/mod.rs
//! DID resolution: mapping a DID string to a validated DID Document.
//!
//! Resolution is cache-first. The cache is populated three ways:
//! - direct document exchange during the connection handshake
//! - explicit priming by the caller (`SimpleNode::add_peer_document`)
//! - an optional external [`ResolutionBackend`] (e.g. [`HttpResolver`])
//!
//! Cached documents go stale after a configurable TTL and are evicted after
//! repeated connection failures against their endpoint. Documents are
//! replaced on update, never mutated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::RwLock;

use crate::error::{NodeError, Result};
use crate::models::did::DidDocument;

/// Connection failures tolerated before a cached document is invalidated.
const FAILURES_BEFORE_EVICTION: u32 = 3;

/// External resolution channel: fetches DID Document JSON for a DID.
///
/// Implementations must not validate the document; the resolver runs the
/// full parse-and-verify step on whatever the backend returns.
#[async_trait]
pub trait ResolutionBackend: Send + Sync {
    /// Fetches the raw DID Document JSON for `did`.
    async fn fetch_document(&self, did: &str) -> Result<String>;
}

/// Resolution backend backed by an HTTP resolution service.
///
/// Issues `GET {base_url}/resolve/{did}` and expects the DID Document JSON
/// as the response body.
pub struct HttpResolver {
    base_url: String,
    client: reqwest::Client,
}

impl HttpResolver {
    /// Creates a resolver client for the given service base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpResolver {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ResolutionBackend for HttpResolver {
    async fn fetch_document(&self, did: &str) -> Result<String> {
        let url = format!("{}/resolve/{}", self.base_url, did);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NodeError::Resolution(format!("resolution request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NodeError::Resolution(format!(
                "resolution service returned {} for {}",
                response.status(),
                did
            )));
        }

        response
            .text()
            .await
            .map_err(|e| NodeError::Resolution(format!("resolution response unreadable: {}", e)))
    }
}

/// Cached knowledge about a peer.
///
/// Holds the validated document plus bookkeeping; it never owns the peer's
/// identity or connection.
struct PeerRecord {
    document: DidDocument,
    cached_at: Instant,
    last_seen: DateTime<Utc>,
    failures: u32,
}

/// Cache-first DID resolver.
pub struct DidResolver {
    cache: RwLock<HashMap<String, PeerRecord>>,
    ttl: Duration,
    lookup_timeout: Duration,
    backend: Option<Arc<dyn ResolutionBackend>>,
}

impl DidResolver {
    /// Creates a resolver with the given staleness TTL and lookup deadline.
    pub fn new(
        ttl: Duration,
        lookup_timeout: Duration,
        backend: Option<Arc<dyn ResolutionBackend>>,
    ) -> Self {
        DidResolver {
            cache: RwLock::new(HashMap::new()),
            ttl,
            lookup_timeout,
            backend,
        }
    }

    /// Resolves a DID to its validated document.
    ///
    /// Returns the cached document if present and fresh; otherwise fetches
    /// from the external backend, validates, and caches.
    ///
    /// # Errors
    /// - [`NodeError::Resolution`] if the DID is malformed, no fresh cache
    ///   entry exists and no backend is configured, or the backend fails
    /// - [`NodeError::Timeout`] if the backend lookup exceeds its deadline
    /// - [`NodeError::DocumentInvalid`] if the fetched document fails
    ///   verification or was issued for a different DID
    pub async fn resolve(&self, did: &str) -> Result<DidDocument> {
        validate_did_syntax(did)?;

        {
            let mut cache = self.cache.write().await;
            if let Some(record) = cache.get_mut(did) {
                if record.cached_at.elapsed() < self.ttl {
                    record.last_seen = Utc::now();
                    return Ok(record.document.clone());
                }
                debug!("cached document for {} is stale", did);
            }
        }

        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| NodeError::Resolution(format!("no document known for {}", did)))?;

        let json = tokio::time::timeout(self.lookup_timeout, backend.fetch_document(did))
            .await
            .map_err(|_| NodeError::Timeout(format!("resolution lookup for {}", did)))??;

        let document = DidDocument::parse(&json)?;
        if document.id() != did {
            return Err(NodeError::DocumentInvalid(format!(
                "backend returned document for {} instead of {}",
                document.id(),
                did
            )));
        }

        self.cache_document(document.clone()).await;
        Ok(document)
    }

    /// Inserts or replaces a validated document in the cache.
    ///
    /// Used for handshake document exchange and caller-side priming.
    pub async fn cache_document(&self, document: DidDocument) {
        let mut cache = self.cache.write().await;
        cache.insert(
            document.id().to_string(),
            PeerRecord {
                document,
                cached_at: Instant::now(),
                last_seen: Utc::now(),
                failures: 0,
            },
        );
    }

    /// Records a connection failure against a DID's cached endpoint.
    ///
    /// After repeated failures the entry is evicted so the next resolve
    /// refetches instead of redialing a dead endpoint.
    pub async fn note_connection_failure(&self, did: &str) {
        let mut cache = self.cache.write().await;
        let evict = match cache.get_mut(did) {
            Some(record) => {
                record.failures += 1;
                record.failures >= FAILURES_BEFORE_EVICTION
            }
            None => false,
        };
        if evict {
            warn!("evicting {} after repeated connection failures", did);
            cache.remove(did);
        }
    }

    /// Whether a (possibly stale) document is cached for `did`.
    pub async fn is_cached(&self, did: &str) -> bool {
        self.cache.read().await.contains_key(did)
    }
}

/// Checks the basic `did:<method>:<id>` shape.
fn validate_did_syntax(did: &str) -> Result<()> {
    let mut parts = did.splitn(3, ':');
    let scheme = parts.next().unwrap_or_default();
    let method = parts.next().unwrap_or_default();
    let id = parts.next().unwrap_or_default();
    if scheme != "did" || method.is_empty() || id.is_empty() {
        return Err(NodeError::Resolution(format!("malformed DID: {}", did)));
    }
    Ok(())
}
