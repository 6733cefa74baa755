// src/session/mod.rs
//! Session/connection registry: one authenticated connection per remote DID.
//!
//! The registry owns every live [`Connection`] and enforces the two rules
//! that keep peer churn deterministic:
//! - `get_or_create` is single-flight per DID: concurrent callers observe
//!   at most one handshake in flight and share its outcome, success or
//!   failure
//! - at most one live connection per remote DID: when a newer handshake
//!   completes, the older connection is closed ("last handshake wins"),
//!   which also resolves simultaneous-connect races
//!
//! The dialing and authenticating phases of a connection live inside the
//! establishment future; a connection enters the registry `Established`
//! and leaves through `Closing → Closed` (no connection is represented by
//! absence from the registry).

pub mod handshake;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::identity::IdentityManager;
use crate::models::did::DidDocument;
use crate::models::envelope::{Envelope, WireFrame};
use crate::resolver::DidResolver;
use crate::router::{self, Inbox, NodeMetrics};
use crate::transport::{self, WsStream};
use crate::utils::serialization::{deserialize, serialize};

/// Lifecycle of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake complete; envelopes flow.
    Established,
    /// Teardown started.
    Closing,
    /// Connection is gone; the registry entry is removed.
    Closed,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<Connection>>>>;

/// Outcome slot of one in-flight establishment, shared by every caller
/// that joined the flight. `None` until the leading caller finishes.
type FlightSlot = Arc<Mutex<Option<Result<Arc<Connection>>>>>;

/// An authenticated, established connection to one remote DID.
pub struct Connection {
    id: u64,
    remote_did: String,
    remote_document: DidDocument,
    direction: Direction,
    state: std::sync::Mutex<ConnectionState>,
    writer: Mutex<SplitSink<WsStream, Message>>,
    next_sequence: AtomicU64,
    last_received: AtomicU64,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// DID of the peer this connection is authenticated as.
    pub fn remote_did(&self) -> &str {
        &self.remote_did
    }

    /// The peer document authenticated during the handshake.
    pub fn remote_document(&self) -> &DidDocument {
        &self.remote_document
    }

    /// Whether this side dialed or accepted.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Seals and sends one envelope; `Ok` means the transport accepted
    /// the write.
    ///
    /// The sequence number is allocated while holding the writer, so
    /// concurrent senders put strictly increasing sequences on the wire
    /// and the peer's replay guard never sees reordering.
    pub async fn send_envelope(
        &self,
        identity: &IdentityManager,
        plaintext: &str,
    ) -> Result<()> {
        if self.state() != ConnectionState::Established {
            return Err(NodeError::Connect(format!(
                "connection to {} is not established",
                self.remote_did
            )));
        }
        let mut writer = self.writer.lock().await;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = router::seal_envelope(identity, &self.remote_document, plaintext, sequence)?;
        let json = serialize(&WireFrame::Envelope(envelope))?;
        writer
            .send(Message::Text(json))
            .await
            .map_err(|e| NodeError::Connect(format!("send to {} failed: {}", self.remote_did, e)))
    }

    /// Sends one control frame; `Ok` means the transport accepted the write.
    pub async fn send_frame(&self, frame: &WireFrame) -> Result<()> {
        if self.state() != ConnectionState::Established {
            return Err(NodeError::Connect(format!(
                "connection to {} is not established",
                self.remote_did
            )));
        }
        let json = serialize(frame)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| NodeError::Connect(format!("send to {} failed: {}", self.remote_did, e)))
    }

    async fn send_raw(&self, message: Message) {
        let _ = self.writer.lock().await.send(message).await;
    }

    /// Graceful teardown: announce, close the transport, stop the reader.
    async fn close(&self) {
        self.set_state(ConnectionState::Closing);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.set_state(ConnectionState::Closed);
        debug!("connection to {} closed", self.remote_did);
    }
}

/// Registry of live connections, one per remote DID.
pub struct SessionRegistry {
    identity: Arc<IdentityManager>,
    resolver: Arc<DidResolver>,
    config: NodeConfig,
    inbox: Arc<Inbox>,
    metrics: Arc<NodeMetrics>,
    shutdown: watch::Receiver<bool>,
    connections: ConnectionMap,
    /// In-flight outbound establishments keyed by DID. Entries are removed
    /// when the flight completes.
    flights: Mutex<HashMap<String, FlightSlot>>,
}

impl SessionRegistry {
    /// Creates an empty registry wired to the node's shared components.
    pub fn new(
        identity: Arc<IdentityManager>,
        resolver: Arc<DidResolver>,
        config: NodeConfig,
        inbox: Arc<Inbox>,
        metrics: Arc<NodeMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        SessionRegistry {
            identity,
            resolver,
            config,
            inbox,
            metrics,
            shutdown,
            connections: Arc::new(Mutex::new(HashMap::new())),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the established connection to `did`, if any.
    pub async fn established(&self, did: &str) -> Option<Arc<Connection>> {
        let connections = self.connections.lock().await;
        connections
            .get(did)
            .filter(|c| c.state() == ConnectionState::Established)
            .cloned()
    }

    /// Returns the connection to `did`, establishing it if necessary.
    ///
    /// Single-flight per DID: the first caller for an unconnected DID runs
    /// one resolve+dial+handshake, and every caller that arrives while it
    /// is in flight shares that attempt's outcome — the same connection or
    /// a clone of the same error. A failed flight therefore counts as one
    /// connection failure regardless of how many callers joined it; only
    /// callers arriving after the flight completes start a fresh attempt.
    ///
    /// # Errors
    /// Propagates [`NodeError::Resolution`], [`NodeError::Connect`],
    /// [`NodeError::Timeout`], and [`NodeError::Authentication`] from the
    /// establishment steps; the caller decides retry policy.
    pub async fn get_or_create(&self, did: &str) -> Result<Arc<Connection>> {
        if let Some(connection) = self.established(did).await {
            return Ok(connection);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(did.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut outcome = flight.lock().await;
        if let Some(shared) = outcome.as_ref() {
            // The flight leader finished while we waited; share its result.
            return shared.clone();
        }

        let result = self.establish(did).await;
        *outcome = Some(result.clone());

        // The flight is over; callers arriving from here on retry fresh.
        self.flights.lock().await.remove(did);
        result
    }

    /// One resolve+dial+handshake attempt. Runs at most once per flight.
    async fn establish(&self, did: &str) -> Result<Arc<Connection>> {
        // An inbound handshake may have registered a connection since the
        // caller's lookup.
        if let Some(connection) = self.established(did).await {
            return Ok(connection);
        }

        let document = self.resolver.resolve(did).await?;
        let endpoint = document.messaging_endpoint().to_string();

        debug!("dialing {} at {}", did, endpoint);
        let mut ws = match transport::dial(&endpoint, self.config.connect_timeout).await {
            Ok(ws) => ws,
            Err(e) => {
                self.resolver.note_connection_failure(did).await;
                return Err(e);
            }
        };

        let authenticated = match tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::initiate(&mut ws, &self.identity, did),
        )
        .await
        {
            Ok(Ok(document)) => document,
            Ok(Err(e)) => {
                let _ = ws.close(None).await;
                self.resolver.note_connection_failure(did).await;
                return Err(e);
            }
            Err(_) => {
                let _ = ws.close(None).await;
                self.resolver.note_connection_failure(did).await;
                return Err(NodeError::Timeout(format!("handshake with {}", did)));
            }
        };

        info!("outbound connection to {} established", did);
        Ok(self.register(authenticated, ws, Direction::Outbound).await)
    }

    /// Authenticates an accepted connection and registers it.
    ///
    /// The peer's document learned during the handshake is cached, so every
    /// inbound peer is resolvable afterwards (direct document exchange).
    pub async fn accept_inbound(&self, mut ws: WsStream) -> Result<()> {
        let document = match tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::respond(&mut ws, &self.identity),
        )
        .await
        {
            Ok(Ok(document)) => document,
            Ok(Err(e)) => {
                let _ = ws.close(None).await;
                return Err(e);
            }
            Err(_) => {
                let _ = ws.close(None).await;
                return Err(NodeError::Timeout(
                    "inbound handshake timed out".to_string(),
                ));
            }
        };

        info!("inbound connection from {} established", document.id());
        self.register(document, ws, Direction::Inbound).await;
        Ok(())
    }

    /// Inserts an established connection, closing any older one to the same
    /// DID (last handshake wins), and spawns its reader task.
    async fn register(
        &self,
        document: DidDocument,
        ws: WsStream,
        direction: Direction,
    ) -> Arc<Connection> {
        self.resolver.cache_document(document.clone()).await;

        let (writer, reader_stream) = ws.split();
        let connection = Arc::new(Connection {
            id: rand::random(),
            remote_did: document.id().to_string(),
            remote_document: document,
            direction,
            state: std::sync::Mutex::new(ConnectionState::Established),
            writer: Mutex::new(writer),
            next_sequence: AtomicU64::new(1),
            last_received: AtomicU64::new(0),
            reader: std::sync::Mutex::new(None),
        });

        let superseded = {
            let mut connections = self.connections.lock().await;
            connections.insert(connection.remote_did.clone(), connection.clone())
        };
        if let Some(old) = superseded {
            info!(
                "newer connection to {} supersedes the existing one",
                connection.remote_did
            );
            old.close().await;
        }
        self.metrics.record_connection();

        let handle = tokio::spawn(reader_loop(
            reader_stream,
            connection.clone(),
            self.identity.clone(),
            self.inbox.clone(),
            self.metrics.clone(),
            self.connections.clone(),
            self.shutdown.clone(),
        ));
        *connection.reader.lock().unwrap() = Some(handle);

        connection
    }

    /// Closes and removes the connection to `did`, if any.
    pub async fn close(&self, did: &str) {
        let removed = self.connections.lock().await.remove(did);
        if let Some(connection) = removed {
            connection.send_frame(&WireFrame::Bye).await.ok();
            connection.close().await;
        }
    }

    /// Tears down every connection. Used by node shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, c)| c).collect()
        };
        for connection in drained {
            connection.send_frame(&WireFrame::Bye).await.ok();
            connection.close().await;
        }
    }

    /// Number of live registry entries.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether the registry holds no connections.
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

/// Per-connection reader: verifies, decrypts, and delivers inbound
/// envelopes until the connection or the node goes down.
async fn reader_loop(
    mut stream: SplitStream<WsStream>,
    connection: Arc<Connection>,
    identity: Arc<IdentityManager>,
    inbox: Arc<Inbox>,
    metrics: Arc<NodeMetrics>,
    connections: ConnectionMap,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match deserialize::<WireFrame>(&text) {
                    Ok(WireFrame::Envelope(envelope)) => {
                        handle_envelope(&connection, &identity, &inbox, &metrics, envelope);
                    }
                    Ok(WireFrame::Bye) => {
                        debug!("{} said goodbye", connection.remote_did());
                        break;
                    }
                    Ok(_) => {
                        warn!(
                            "unexpected handshake frame from {} on established connection",
                            connection.remote_did()
                        );
                    }
                    Err(e) => {
                        warn!("invalid frame from {}: {}", connection.remote_did(), e);
                        metrics.record_dropped();
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    connection.send_raw(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("connection to {} closed by peer", connection.remote_did());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("transport error from {}: {}", connection.remote_did(), e);
                    break;
                }
            }
        }
    }

    connection.set_state(ConnectionState::Closed);
    let mut map = connections.lock().await;
    if map.get(connection.remote_did()).map(|c| c.id) == Some(connection.id) {
        map.remove(connection.remote_did());
    }
}

/// Verification pipeline for one inbound envelope. Failures drop the
/// envelope and bump the counter; nothing unverified reaches the inbox.
fn handle_envelope(
    connection: &Connection,
    identity: &IdentityManager,
    inbox: &Inbox,
    metrics: &NodeMetrics,
    envelope: Envelope,
) {
    let sequence = envelope.sequence;
    let last = connection.last_received.load(Ordering::SeqCst);
    if sequence <= last {
        warn!(
            "dropping replayed envelope {} (last {}) from {}",
            sequence,
            last,
            connection.remote_did()
        );
        metrics.record_dropped();
        return;
    }

    match router::open_envelope(identity, connection.remote_document(), &envelope) {
        Ok((sender_did, plaintext)) => {
            connection.last_received.store(sequence, Ordering::SeqCst);
            inbox.push(sender_did, plaintext);
        }
        Err(e) => {
            warn!("dropping envelope from {}: {}", connection.remote_did(), e);
            metrics.record_dropped();
        }
    }
}
