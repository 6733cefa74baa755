// src/node.rs
//! The node façade: lifecycle control coordinating identity, resolution,
//! transport, sessions, and the inbox.
//!
//! A `SimpleNode` is an explicit object owning all of its state — no
//! process-wide singletons — so any number of nodes can live in one
//! process (which is also how the integration tests run two ends of a
//! conversation).

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::identity::IdentityManager;
use crate::models::did::DidDocument;
use crate::resolver::{DidResolver, ResolutionBackend};
use crate::router::{Inbox, NodeMetrics};
use crate::session::SessionRegistry;
use crate::transport;

pub use crate::router::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct RuntimeState {
    phase: Phase,
    registry: Option<Arc<SessionRegistry>>,
    listener: Option<JoinHandle<()>>,
}

/// A DID-identified messaging node.
///
/// Construction, identity installation, and lifecycle are separate steps,
/// mirroring how callers persist identities across restarts:
///
/// 1. [`SimpleNode::new`] with the listener configuration
/// 2. [`SimpleNode::generate_did_document`] (first boot) or stored values
/// 3. [`SimpleNode::set_did_info`] to install the identity
/// 4. [`SimpleNode::run`], then [`SimpleNode::send_message`] /
///    [`SimpleNode::receive_message`]
/// 5. [`SimpleNode::stop`]
pub struct SimpleNode {
    config: NodeConfig,
    identity: StdRwLock<Option<Arc<IdentityManager>>>,
    resolver: Arc<DidResolver>,
    inbox: Arc<Inbox>,
    metrics: Arc<NodeMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    runtime: StdMutex<RuntimeState>,
}

impl SimpleNode {
    /// Creates a node without an external resolution backend.
    ///
    /// Peers become resolvable through handshake document exchange or
    /// [`SimpleNode::add_peer_document`].
    pub fn new(config: NodeConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a node that falls back to an external resolution service
    /// for DIDs not found in the cache.
    pub fn with_resolution_backend(
        config: NodeConfig,
        backend: Arc<dyn ResolutionBackend>,
    ) -> Self {
        Self::build(config, Some(backend))
    }

    fn build(config: NodeConfig, backend: Option<Arc<dyn ResolutionBackend>>) -> Self {
        let resolver = Arc::new(DidResolver::new(
            config.resolve_ttl,
            config.resolution_timeout,
            backend,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        SimpleNode {
            config,
            identity: StdRwLock::new(None),
            resolver,
            inbox: Arc::new(Inbox::new()),
            metrics: Arc::new(NodeMetrics::default()),
            shutdown_tx,
            shutdown_rx,
            runtime: StdMutex::new(RuntimeState {
                phase: Phase::Idle,
                registry: None,
                listener: None,
            }),
        }
    }

    /// Generates a fresh identity for this node's configured endpoint.
    ///
    /// Returns `(private_key_hex, did, did_document_json)` for the caller
    /// to persist and to pass to [`SimpleNode::set_did_info`]. Generation
    /// does not install the identity.
    pub fn generate_did_document(&self) -> Result<(String, String, String)> {
        let identity = IdentityManager::generate(&self.config)?;
        Ok(identity.export())
    }

    /// Installs the node identity from its exported triple.
    ///
    /// # Errors
    /// - [`NodeError::AlreadyRunning`] if called while the node runs
    ///   (identity is immutable for the node's lifetime)
    /// - [`NodeError::IdentityMismatch`] / [`NodeError::DocumentInvalid`]
    ///   if the triple is inconsistent
    pub fn set_did_info(
        &self,
        private_key_hex: &str,
        did: &str,
        did_document_json: &str,
    ) -> Result<()> {
        {
            let runtime = self.runtime.lock().unwrap();
            if runtime.phase == Phase::Running {
                return Err(NodeError::AlreadyRunning);
            }
        }
        let identity = IdentityManager::load(private_key_hex, did, did_document_json)?;
        *self.identity.write().unwrap() = Some(Arc::new(identity));
        Ok(())
    }

    /// This node's DID, if an identity is installed.
    pub fn did(&self) -> Option<String> {
        self.identity
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.did().to_string())
    }

    /// Exports the installed identity triple for caller-side persistence.
    pub fn export_identity(&self) -> Option<(String, String, String)> {
        self.identity.read().unwrap().as_ref().map(|i| i.export())
    }

    /// Primes the resolver cache with a peer's DID Document JSON.
    ///
    /// Returns the peer's DID on success. This is how callers that learned
    /// a document out of band (files, directories, QR codes) make the peer
    /// resolvable before the first dial.
    pub async fn add_peer_document(&self, did_document_json: &str) -> Result<String> {
        let document = DidDocument::parse(did_document_json)?;
        let did = document.id().to_string();
        self.resolver.cache_document(document).await;
        Ok(did)
    }

    /// Starts the listener and background connection handling.
    ///
    /// Non-blocking: accepting runs on its own task. Requires an installed
    /// identity.
    ///
    /// # Errors
    /// - [`NodeError::AlreadyRunning`] on a second call
    /// - [`NodeError::NodeStopped`] after [`SimpleNode::stop`]
    /// - [`NodeError::Connect`] if the bind fails
    pub async fn run(&self) -> Result<()> {
        let identity = self
            .identity
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                NodeError::IdentityMismatch(
                    "no identity installed; call set_did_info first".to_string(),
                )
            })?;

        {
            let runtime = self.runtime.lock().unwrap();
            match runtime.phase {
                Phase::Running => return Err(NodeError::AlreadyRunning),
                Phase::Stopped => return Err(NodeError::NodeStopped),
                Phase::Idle => {}
            }
        }

        let (listener, local_addr) = transport::bind(&self.config.bind_addr()).await?;
        let registry = Arc::new(SessionRegistry::new(
            identity.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.inbox.clone(),
            self.metrics.clone(),
            self.shutdown_rx.clone(),
        ));

        let accept_registry = registry.clone();
        let path = self.config.host_ws_path.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted transport connection from {}", peer_addr);
                            let registry = accept_registry.clone();
                            let path = path.clone();
                            tokio::spawn(async move {
                                match transport::accept(stream, &path).await {
                                    Ok(ws) => {
                                        if let Err(e) = registry.accept_inbound(ws).await {
                                            warn!("inbound connection rejected: {}", e);
                                        }
                                    }
                                    Err(e) => warn!("websocket upgrade failed: {}", e),
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        });

        {
            let mut runtime = self.runtime.lock().unwrap();
            if runtime.phase != Phase::Idle {
                // Lost a race with a concurrent run() or stop().
                listener_task.abort();
                return Err(NodeError::AlreadyRunning);
            }
            runtime.phase = Phase::Running;
            runtime.registry = Some(registry);
            runtime.listener = Some(listener_task);
        }

        info!("node {} listening on {}", identity.did(), local_addr);
        Ok(())
    }

    /// Sends a message to a DID-identified peer.
    ///
    /// Returns `true` only when the transport accepted the transmission.
    /// Every failure cause — resolution, connection, authentication,
    /// transmission — returns `false`; the structured cause is logged and
    /// counted in [`SimpleNode::metrics`], never guessable from the
    /// boolean alone.
    pub async fn send_message(&self, message: &str, recipient_did: &str) -> bool {
        match self.try_send(message, recipient_did).await {
            Ok(()) => {
                self.metrics.record_sent();
                true
            }
            Err(e) => {
                warn!("failed to send message to {}: {}", recipient_did, e);
                self.metrics.record_send_failure();
                false
            }
        }
    }

    async fn try_send(&self, message: &str, recipient_did: &str) -> Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow() {
            return Err(NodeError::NodeStopped);
        }
        let registry = {
            let runtime = self.runtime.lock().unwrap();
            runtime.registry.clone()
        }
        .ok_or_else(|| NodeError::Connect("node is not running".to_string()))?;
        let identity = self
            .identity
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| NodeError::IdentityMismatch("no identity installed".to_string()))?;

        // Establishment can block on dial and handshake deadlines; a stop()
        // while it is in flight abandons the attempt instead of letting the
        // send land after shutdown.
        let connection = tokio::select! {
            result = registry.get_or_create(recipient_did) => result?,
            _ = shutdown.changed() => return Err(NodeError::NodeStopped),
        };
        if *shutdown.borrow() {
            return Err(NodeError::NodeStopped);
        }
        connection.send_envelope(&identity, message).await
    }

    /// Receives the next verified message as `(sender_did, plaintext)`.
    ///
    /// Suspends until a message arrives. Concurrent callers share one
    /// queue; each message goes to exactly one caller. Fails fast with
    /// [`NodeError::NodeStopped`] once the node stops.
    pub async fn receive_message(&self) -> Result<(String, String)> {
        self.inbox.pop(self.shutdown_rx.clone()).await
    }

    /// Cooperative shutdown.
    ///
    /// Cancels the listener and all connection readers, closes every
    /// connection, and wakes pending `receive_message` calls with
    /// [`NodeError::NodeStopped`]. Safe to call concurrently with
    /// in-flight sends and receives, and idempotent.
    pub async fn stop(&self) {
        let (registry, listener) = {
            let mut runtime = self.runtime.lock().unwrap();
            if runtime.phase == Phase::Stopped {
                return;
            }
            runtime.phase = Phase::Stopped;
            (runtime.registry.take(), runtime.listener.take())
        };

        let _ = self.shutdown_tx.send(true);
        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(registry) = registry {
            registry.close_all().await;
        }
        info!("node stopped");
    }

    /// Snapshot of the node's observability counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The configuration this node was created with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}
