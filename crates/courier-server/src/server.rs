use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use courier_core::connection::{Client, Connection};
use courier_core::ids::ClientId;
use courier_manager::{Manager, StatsSnapshot};

use crate::ws::WsConnection;

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9100,
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub keepalive: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving. The manager must already be started for
/// envelopes to flow.
pub async fn start(config: ServerConfig, manager: Arc<Manager>) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        manager,
        keepalive: config.keepalive,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "courier server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the listener to wind down.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    uid: Option<String>,
}

/// WebSocket upgrade handler. `uid` names the identity the socket is bound to.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(uid) = params.uid.filter(|u| !u.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing uid").into_response();
    };
    let client = ClientId::from_raw(uid);
    ws.on_upgrade(move |socket| handle_socket(socket, client, state))
}

/// Register the socket and hold it until its ingestion pipeline ends.
async fn handle_socket(socket: WebSocket, client: ClientId, state: AppState) {
    tracing::info!(client_id = %client, "websocket client connected");
    let conn = WsConnection::new(socket, client.clone(), state.keepalive);

    match state.manager.register(Client::new(client.clone(), conn.clone())).await {
        Ok(ingestion) => ingestion.finished().await,
        Err(e) => {
            tracing::warn!(client_id = %client, error = %e, "rejecting connection");
            conn.close().await;
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    instance_id: String,
    clients: usize,
    dispatcher: &'static str,
    stats: StatsSnapshot,
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let manager = &state.manager;
    let running = manager.dispatcher_running();
    let body = HealthBody {
        status: if running { "healthy" } else { "degraded" },
        instance_id: manager.instance_id().to_string(),
        clients: manager.client_count(),
        dispatcher: if running { "running" } else { "stopped" },
        stats: manager.stats(),
    };
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use courier_core::envelope::{Envelope, EnvelopeKind};
    use courier_core::ids::InstanceId;
    use courier_core::testing::{MemoryExchange, MemoryRoutingTable};
    use courier_manager::{ManagerConfig, ManagerHandle};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn boot(started: bool) -> (Arc<Manager>, Option<ManagerHandle>, ServerHandle) {
        let instance = InstanceId::from_raw("inst_test");
        let exchange = MemoryExchange::new();
        let (manager, rx) = Manager::new(
            instance.clone(),
            MemoryRoutingTable::new(),
            exchange.broker(instance),
            ManagerConfig::default(),
        );
        let manager = Arc::new(manager);
        let handle = if started {
            Some(manager.start(rx).await.unwrap())
        } else {
            None
        };
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let server = start(config, Arc::clone(&manager)).await.unwrap();
        (manager, handle, server)
    }

    async fn connect(port: u16, uid: &str, manager: &Manager) -> Socket {
        let url = format!("ws://127.0.0.1:{port}/ws?uid={uid}");
        let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let id = ClientId::from_raw(uid);
        for _ in 0..200 {
            if manager.is_managed(&id) {
                return socket;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{uid} never registered");
    }

    async fn next_envelope(socket: &mut Socket) -> Envelope {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return Envelope::from_json(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (_manager, _handle, server) = boot(true).await;
        assert!(server.port > 0);

        let url = format!("http://127.0.0.1:{}/health", server.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["instance_id"], "inst_test");
        assert_eq!(body["dispatcher"], "running");
        assert_eq!(body["clients"], 0);
    }

    #[tokio::test]
    async fn health_reports_stopped_dispatcher() {
        let (_manager, _handle, server) = boot(false).await;

        let url = format!("http://127.0.0.1:{}/health", server.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["dispatcher"], "stopped");
    }

    #[tokio::test]
    async fn missing_uid_is_rejected() {
        let (_manager, _handle, server) = boot(true).await;

        for url in [
            format!("ws://127.0.0.1:{}/ws", server.port),
            format!("ws://127.0.0.1:{}/ws?uid=", server.port),
        ] {
            match tokio_tungstenite::connect_async(url).await {
                Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                    assert_eq!(resp.status(), 400);
                }
                other => panic!("expected http 400, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn direct_message_between_websocket_clients() {
        let (manager, _handle, server) = boot(true).await;
        let mut alice = connect(server.port, "alice", &manager).await;
        let mut bob = connect(server.port, "bob", &manager).await;

        let outgoing = Envelope::new(
            EnvelopeKind::DirectMessage,
            "hi bob",
            ClientId::from_raw("mallory"),
            ClientId::from_raw("bob"),
        );
        alice
            .send(Message::text(outgoing.to_json().unwrap()))
            .await
            .unwrap();

        let got = next_envelope(&mut bob).await;
        assert_eq!(got.kind, EnvelopeKind::DirectMessage);
        assert_eq!(got.from, ClientId::from_raw("alice"));
        assert_eq!(&got.payload[..], b"hi bob");
    }

    #[tokio::test]
    async fn garbage_frame_gets_format_error() {
        let (manager, _handle, server) = boot(true).await;
        let mut alice = connect(server.port, "alice", &manager).await;

        alice.send(Message::text("definitely not json")).await.unwrap();

        let got = next_envelope(&mut alice).await;
        assert_eq!(got.kind, EnvelopeKind::Echo);
        assert_eq!(got.from, ClientId::server());
        assert_eq!(&got.payload[..], b"format err, can't parse");
    }

    #[tokio::test]
    async fn disconnect_releases_client() {
        let (manager, _handle, server) = boot(true).await;
        let mut alice = connect(server.port, "alice", &manager).await;

        alice.close(None).await.unwrap();

        let id = ClientId::from_raw("alice");
        for _ in 0..200 {
            if !manager.is_managed(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("alice still registered");
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_socket() {
        let (manager, _handle, server) = boot(true).await;
        let mut first = connect(server.port, "alice", &manager).await;
        let mut second = connect(server.port, "alice", &manager).await;

        // The first socket is closed by the server.
        loop {
            match tokio::time::timeout(Duration::from_secs(2), first.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }

        second
            .send(Message::text(
                Envelope::new(EnvelopeKind::Echo, "still here", ClientId::from_raw("alice"), ClientId::from_raw("x"))
                    .to_json()
                    .unwrap(),
            ))
            .await
            .unwrap();
        let got = next_envelope(&mut second).await;
        assert_eq!(&got.payload[..], b"still here");
        assert!(manager.is_managed(&ClientId::from_raw("alice")));
    }
}
