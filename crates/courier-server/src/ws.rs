use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use courier_core::connection::Connection;
use courier_core::envelope::{Envelope, EnvelopeKind};
use courier_core::errors::ConnectionError;
use courier_core::ids::ClientId;

/// A WebSocket bound to one client identity.
///
/// Frames carry JSON envelopes, as text or binary. The sender field of every
/// inbound envelope is overwritten with the bound identity. A frame that does
/// not decode becomes an `Unknown` envelope so the dispatcher can answer it.
pub struct WsConnection {
    client: ClientId,
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl WsConnection {
    /// Wrap `socket` and start pinging every `keepalive`.
    pub fn new(socket: WebSocket, client: ClientId, keepalive: Duration) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let conn = Arc::new(Self {
            client,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        tokio::spawn(keepalive_loop(Arc::downgrade(&conn), conn.closed.clone(), keepalive));
        conn
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn next_frame(&self) -> Result<Envelope, ConnectionError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(decode_frame(&self.client, text.as_bytes())),
                Some(Ok(WsMessage::Binary(data))) => return Ok(decode_frame(&self.client, &data)),
                Some(Ok(WsMessage::Close(_))) | None => return Err(ConnectionError::StreamClosed),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Err(e)) => return Err(ConnectionError::ReadFailure(e.to_string())),
            }
        }
    }
}

/// Decode one inbound frame on behalf of `client`.
pub fn decode_frame(client: &ClientId, raw: &[u8]) -> Envelope {
    match Envelope::from_json_bytes(raw) {
        Ok(envelope) => envelope.with_sender(client.clone()),
        Err(e) => {
            tracing::debug!(client_id = %client, error = %e, "undecodable frame");
            Envelope::new(
                EnvelopeKind::Unknown,
                raw.to_vec(),
                client.clone(),
                ClientId::server(),
            )
        }
    }
}

async fn keepalive_loop(conn: Weak<WsConnection>, closed: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {
                let Some(conn) = conn.upgrade() else { break };
                if conn.sink.lock().await.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                tracing::trace!(client_id = %conn.client, "sent ping");
            }
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn receive(&self) -> Result<Envelope, ConnectionError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ConnectionError::StreamClosed),
            frame = self.next_frame() => frame,
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::WriteFailure("connection closed".into()));
        }
        let json = envelope
            .to_json()
            .map_err(|e| ConnectionError::WriteFailure(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| ConnectionError::WriteFailure(e.to_string()))
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
        tracing::debug!(client_id = %self.client, "websocket closed");
    }
}
