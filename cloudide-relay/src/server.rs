//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── SessionRegistry (doc1, doc2, …)
//!             ├── ConnectionGateway ────┼── ChangeRelay ──┐
//! Client B ──┘        │                 └── PresenceTracker┤
//!                     │                                    ▼
//!                     └──────────── Outboxes (one per participant)
//!                                          │
//!                          ┌───────────────┼───────────────┐
//!                          ▼               ▼               ▼
//!                       Client A        Client B        Client C
//! ```
//!
//! Each connection runs one task that multiplexes inbound WebSocket frames
//! and the participant's outbox. Whatever ends the task (close frame, socket
//! error, outbox shutdown, server shutdown), the participant is disconnected
//! from the gateway before the task exits.
//!
//! A plain `GET /health` (no upgrade) on the same port is answered with a
//! JSON [`HealthReport`] instead of a WebSocket handshake.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::gateway::{Connection, ConnectionGateway};
use crate::outbox::Inbox;
use crate::protocol::ParticipantId;

type ServerError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Longest request head read while answering a health check.
const MAX_HEALTH_REQUEST_BYTES: usize = 8 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Origins allowed to open a WebSocket (empty = any origin)
    pub allowed_origins: Vec<String>,
    /// Maximum participants per session
    pub max_participants_per_session: usize,
    /// Largest accepted WebSocket message, in bytes
    pub max_message_bytes: usize,
    /// How long open connections may take to close on shutdown (seconds)
    pub shutdown_grace_secs: u64,
    /// Interval between sweeps of sessions left without members (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            allowed_origins: Vec::new(),
            max_participants_per_session: 100,
            max_message_bytes: 10 * 1024 * 1024,
            shutdown_grace_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Whether a handshake carrying `origin` may proceed.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.trim_end_matches('/') == origin.trim_end_matches('/'))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub health_checks: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub changes_relayed: u64,
    pub deliveries_sent: u64,
    pub deliveries_dropped: u64,
    pub uptime_secs: u64,
}

/// Body of the `GET /health` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub active_connections: u64,
    pub active_sessions: usize,
    pub changes_relayed: u64,
}

impl HealthReport {
    pub fn from_stats(stats: &ServerStats) -> Self {
        Self {
            status: "OK",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: stats.uptime_secs,
            active_connections: stats.active_connections,
            active_sessions: stats.active_sessions,
            changes_relayed: stats.changes_relayed,
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    gateway: Arc<ConnectionGateway>,
    /// Connection-level counters; the rest of [`ServerStats`] is read live.
    stats: Arc<RwLock<ServerStats>>,
    started_at: Instant,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let gateway = Arc::new(ConnectionGateway::new(config.max_participants_per_session));
        Self {
            config: Arc::new(config),
            gateway,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            started_at: Instant::now(),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Serve connections from an already bound listener, forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed, every open connection is sent a
    /// close frame and disconnected from the gateway, and this waits up to
    /// `shutdown_grace_secs` for the connection tasks to finish before
    /// aborting the rest.
    pub async fn serve_until(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        let closing = CancellationToken::new();
        let mut connections = JoinSet::new();
        let mut sweep = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Failed to accept TCP connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let gateway = self.gateway.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();
                    let closing = closing.child_token();
                    let started_at = self.started_at;

                    connections.spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, gateway, stats, config, closing, started_at).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }

                _ = sweep.tick() => {
                    let pruned = self.gateway.registry().prune_empty_sessions().await;
                    if pruned > 0 {
                        log::debug!("Pruned {pruned} sessions without members");
                    }
                }
            }
        }

        drop(listener);
        log::info!(
            "Shutdown requested, closing {} open connections",
            connections.len()
        );
        closing.cancel();

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "{} connections still open after {grace:?}, aborting them",
                connections.len()
            );
            connections.shutdown().await;
        }
        log::info!("Relay server stopped");
        Ok(())
    }

    /// Handle a single TCP connection: a health check or a WebSocket session.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<ConnectionGateway>,
        stats: Arc<RwLock<ServerStats>>,
        config: Arc<ServerConfig>,
        closing: CancellationToken,
        started_at: Instant,
    ) -> Result<(), ServerError> {
        if is_health_request(&stream).await? {
            let report = {
                let mut s = stats.write().await;
                s.health_checks += 1;
                HealthReport::from_stats(&Self::snapshot(&s, &gateway, started_at).await)
            };
            log::debug!("Health check from {addr}");
            return answer_health(stream, &report).await;
        }

        let origin_check = config.clone();
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let Some(origin) = request.headers().get(ORIGIN) else {
                return Ok(response);
            };
            match origin.to_str() {
                Ok(origin) if origin_check.origin_allowed(origin) => Ok(response),
                _ => {
                    log::warn!("Rejected WebSocket handshake from {addr}: origin {origin:?} not allowed");
                    let mut rejection = ErrorResponse::new(Some("Origin not allowed".to_string()));
                    *rejection.status_mut() = StatusCode::FORBIDDEN;
                    Err(rejection)
                }
            }
        };

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(config.max_message_bytes))
            .max_frame_size(Some(config.max_message_bytes));

        let ws_stream =
            match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
                .await
            {
                Ok(ws) => ws,
                Err(e) => {
                    stats.write().await.rejected_handshakes += 1;
                    return Err(e.into());
                }
            };
        let (ws_sender, ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let Connection {
            participant_id,
            inbox,
        } = gateway.on_connect();

        let result = Self::pump(
            participant_id,
            ws_sender,
            ws_receiver,
            inbox,
            &gateway,
            &stats,
            &closing,
        )
        .await;

        // Runs on every exit path, including transport errors.
        gateway.on_disconnect(participant_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("Participant {participant_id} from {addr} disconnected");

        result
    }

    /// Shuttle frames between the socket and the gateway until either side
    /// ends or the server shuts down.
    async fn pump(
        participant_id: ParticipantId,
        mut ws_sender: WsSender,
        mut ws_receiver: WsReceiver,
        mut inbox: Inbox,
        gateway: &ConnectionGateway,
        stats: &RwLock<ServerStats>,
        closing: &CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = closing.cancelled() => {
                    let farewell = CloseFrame {
                        code: CloseCode::Away,
                        reason: "Server shutting down".into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(farewell))).await;
                    return Ok(());
                }

                // Incoming WebSocket frame
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            gateway.on_text(participant_id, text.as_str()).await;
                        }

                        Some(Ok(Message::Binary(data))) => {
                            log::warn!(
                                "Dropping {}-byte binary frame from {participant_id}: text frames only",
                                data.len()
                            );
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed by {participant_id}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            return Err(e.into());
                        }

                        _ => {}
                    }
                }

                // Outgoing message from this participant's outbox
                outgoing = inbox.recv() => {
                    match outgoing {
                        Some(message) => {
                            let text = message.encode()?;
                            ws_sender.send(Message::Text(text.into())).await?;
                        }
                        None => {
                            log::debug!("Outbox for {participant_id} closed");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn snapshot(
        counters: &ServerStats,
        gateway: &ConnectionGateway,
        started_at: Instant,
    ) -> ServerStats {
        let mut stats = counters.clone();
        let delivery = gateway.outboxes().stats();
        stats.active_sessions = gateway.registry().session_count().await;
        stats.changes_relayed = gateway.relay().changes_relayed();
        stats.deliveries_sent = delivery.messages_sent;
        stats.deliveries_dropped = delivery.messages_dropped;
        stats.uptime_secs = started_at.elapsed().as_secs();
        stats
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let counters = self.stats.read().await.clone();
        Self::snapshot(&counters, &self.gateway, self.started_at).await
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Gateway shared by all connections.
    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }
}

/// Whether the request waiting on `stream` is a plain `GET /health`.
///
/// Only peeks, so a WebSocket handshake still sees the full request.
async fn is_health_request(stream: &TcpStream) -> std::io::Result<bool> {
    let mut head = [0u8; 1024];
    let n = stream.peek(&mut head).await?;
    Ok(is_health_head(&head[..n]))
}

fn is_health_head(head: &[u8]) -> bool {
    let Some(target) = head.strip_prefix(b"GET /health") else {
        return false;
    };
    if !matches!(target.first(), Some(b' ' | b'?' | b'/')) {
        return false;
    }
    let lowered = head.to_ascii_lowercase();
    !lowered.windows(b"upgrade: websocket".len()).any(|w| w == b"upgrade: websocket")
}

async fn answer_health(mut stream: TcpStream, report: &HealthReport) -> Result<(), ServerError> {
    // Consume the request head so closing the socket does not reset it.
    let mut request = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") && request.len() < MAX_HEALTH_REQUEST_BYTES {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
    }

    let body = serde_json::to_string(report)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
