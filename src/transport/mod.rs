// src/transport/mod.rs
//! WebSocket transport: inbound listener and outbound dialer.
//!
//! One [`WireFrame`](crate::models::envelope::WireFrame) travels per
//! WebSocket text message, so the transport's own message boundaries give
//! atomic envelope delivery. Within a single connection frames are FIFO;
//! nothing is guaranteed across connections.
//!
//! Inbound and outbound streams are unified under [`WsStream`] so the
//! session layer handles both directions with the same code.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{NodeError, Result};
use crate::models::envelope::WireFrame;
use crate::utils::serialization::{deserialize, serialize};

/// Duplex message stream shared by both connection directions.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binds the inbound TCP listener.
///
/// Accepting and upgrading connections happens on the caller's accept loop;
/// this only performs the bind so failures surface immediately.
pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| NodeError::Connect(format!("failed to bind {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| NodeError::Connect(format!("failed to read local address: {}", e)))?;
    Ok((listener, local_addr))
}

/// Upgrades an accepted TCP stream to a WebSocket, enforcing the listener
/// path.
///
/// Requests for any other path are rejected during the HTTP upgrade.
pub async fn accept(stream: TcpStream, expected_path: &str) -> Result<WsStream> {
    let expected = expected_path.to_string();
    let check_path = move |req: &Request, response: Response| {
        if req.uri().path() == expected {
            Ok(response)
        } else {
            debug!("rejecting upgrade for unknown path {}", req.uri().path());
            let mut rejection = ErrorResponse::new(Some("unknown path".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    accept_hdr_async(MaybeTlsStream::Plain(stream), check_path)
        .await
        .map_err(|e| NodeError::Connect(format!("websocket upgrade failed: {}", e)))
}

/// Opens an outbound WebSocket connection to a `ws://` endpoint.
///
/// # Errors
/// - [`NodeError::Timeout`] if the connection is not up within `deadline`
/// - [`NodeError::Connect`] for refused/unreachable endpoints and failed
///   upgrades; retry policy is the caller's decision
pub async fn dial(endpoint: &str, deadline: Duration) -> Result<WsStream> {
    let connect = connect_async(endpoint);
    let (ws, _) = tokio::time::timeout(deadline, connect)
        .await
        .map_err(|_| NodeError::Timeout(format!("dialing {}", endpoint)))?
        .map_err(|e| NodeError::Connect(format!("dialing {} failed: {}", endpoint, e)))?;
    Ok(ws)
}

/// Sends one frame as a single text message.
pub async fn send_frame(ws: &mut WsStream, frame: &WireFrame) -> Result<()> {
    let json = serialize(frame)?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| NodeError::Connect(format!("send failed: {}", e)))
}

/// Receives the next frame, transparently answering pings.
///
/// Returns `Ok(None)` when the peer closed the connection.
pub async fn next_frame(ws: &mut WsStream) -> Result<Option<WireFrame>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = deserialize(&text)
                    .map_err(|e| NodeError::Connect(format!("invalid frame: {}", e)))?;
                return Ok(Some(frame));
            }
            Some(Ok(Message::Ping(payload))) => {
                // Keepalive handled at the transport level.
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(NodeError::Connect(format!("receive failed: {}", e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_dial_round_trip() {
        let (listener, addr) = bind("127.0.0.1:0").await.unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept(stream, "/ws").await.unwrap();
            let frame = next_frame(&mut ws).await.unwrap();
            assert!(matches!(frame, Some(WireFrame::Bye)));
        });

        let endpoint = format!("ws://{}/ws", addr);
        let mut ws = dial(&endpoint, Duration::from_secs(5)).await.unwrap();
        send_frame(&mut ws, &WireFrame::Bye).await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (listener, addr) = bind("127.0.0.1:0").await.unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            assert!(accept(stream, "/ws").await.is_err());
        });

        let endpoint = format!("ws://{}/other", addr);
        assert!(dial(&endpoint, Duration::from_secs(5)).await.is_err());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Port 1 is essentially never listening.
        let result = dial("ws://127.0.0.1:1/ws", Duration::from_secs(2)).await;
        assert!(matches!(result, Err(NodeError::Connect(_)) | Err(NodeError::Timeout(_))));
    }
}
