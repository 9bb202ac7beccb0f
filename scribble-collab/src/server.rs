//! WebSocket sync server for one shared canvas.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── CanvasHub (owns StrokeStore)
//!            ├── connection tasks ─────┤
//! Client B ──┘        │                └── PresenceBroadcaster (stateless)
//!                     │
//!                     └──◄── BroadcastGroup ◄── strokes / init / cursors
//! ```
//!
//! Each connection:
//! 1. is assigned a fresh session id and subscribed to the broadcast group,
//! 2. receives `Welcome` then `Init` (the current snapshot),
//! 3. forwards its requests to the hub and its pointer samples to the
//!    presence broadcaster,
//! 4. on close, unsubscribes and triggers one `CursorRemove` broadcast.
//!
//! Subscribing before taking the snapshot means a stroke committed in
//! between can arrive twice (in `Init` and as a `Stroke`); clients skip ids
//! they already hold. A session whose receiver lags is resubscribed at the
//! tail and sent a fresh snapshot the same way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Outbound, SessionInfo};
use crate::hub::{CanvasHandle, CanvasHub};
use crate::presence::{PresenceBroadcaster, DEFAULT_PRESENCE_TTL};
use crate::protocol::{MessageType, SyncMessage, UndoRequest, Welcome};
use crate::store::{StoreConfig, StoreError, StrokeStore};
use crate::stroke::UndoScope;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous sessions; extra connections are closed
    pub max_sessions: usize,
    /// Broadcast channel capacity (frames buffered per session)
    pub broadcast_capacity: usize,
    /// Stroke log bounds
    pub store: StoreConfig,
    /// Scope for undo requests that do not name one
    pub undo_scope: UndoScope,
    /// Presence TTL advertised to clients in `Welcome`
    pub presence_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_sessions: 256,
            broadcast_capacity: 1024,
            store: StoreConfig::default(),
            undo_scope: UndoScope::Global,
            presence_ttl: DEFAULT_PRESENCE_TTL,
        }
    }
}

impl ServerConfig {
    /// Build a config from `SCRIBBLE_*` environment variables.
    ///
    /// - `SCRIBBLE_BIND` (or `PORT`, bound on all interfaces)
    /// - `SCRIBBLE_MAX_STROKES`, `SCRIBBLE_PRUNE_TO`
    /// - `SCRIBBLE_UNDO_SCOPE` (`global` | `per-author`)
    /// - `SCRIBBLE_PRESENCE_TTL_MS`
    /// - `SCRIBBLE_MAX_SESSIONS`
    ///
    /// Malformed values are logged and replaced by defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind) = lookup("SCRIBBLE_BIND") {
            config.bind_addr = bind;
        } else if let Some(port) = parse_var::<u16, _>(&lookup, "PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(max) = parse_var(&lookup, "SCRIBBLE_MAX_STROKES") {
            config.store.max_capacity = max;
        }
        if let Some(target) = parse_var(&lookup, "SCRIBBLE_PRUNE_TO") {
            config.store.target_capacity = target;
        }
        if let Some(raw) = lookup("SCRIBBLE_UNDO_SCOPE") {
            match UndoScope::parse(&raw) {
                Some(scope) => config.undo_scope = scope,
                None => log::warn!("Ignoring SCRIBBLE_UNDO_SCOPE={raw:?}"),
            }
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SCRIBBLE_PRESENCE_TTL_MS") {
            config.presence_ttl = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, "SCRIBBLE_MAX_SESSIONS") {
            config.max_sessions = max;
        }

        if let Err(e) = config.store.validate() {
            log::warn!("{e}; falling back to default store bounds");
            config.store = StoreConfig::default();
        }
        config
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that failed to decode or carried an unexpected type
    pub ignored_messages: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    hub: CanvasHandle,
    group: Arc<BroadcastGroup>,
    presence: PresenceBroadcaster,
    stats: Arc<RwLock<ServerStats>>,
    welcome: Welcome,
    max_sessions: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
    /// Hub waiting to be spawned by `run`
    hub_task: Option<CanvasHub>,
}

impl SyncServer {
    /// Create a server. Fails only on an invalid store config.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = StrokeStore::new(config.store.clone())?;
        Ok(Self::with_store(config, store))
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), StrokeStore::with_defaults())
    }

    fn with_store(config: ServerConfig, store: StrokeStore) -> Self {
        let group = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let (hub_task, hub) = CanvasHub::new(store, config.undo_scope, group.clone());

        let shared = Shared {
            hub,
            presence: PresenceBroadcaster::new(group.clone()),
            group,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            welcome: Welcome {
                presence_ttl_ms: config.presence_ttl.as_millis() as u64,
                undo_scope: config.undo_scope,
            },
            max_sessions: config.max_sessions,
        };

        Self {
            config,
            shared,
            hub_task: Some(hub_task),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// Spawns the canvas hub, then runs the accept loop. Call from an async
    /// runtime.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Sync server listening on {} (capacity {}/{}, undo {})",
            self.config.bind_addr,
            self.config.store.max_capacity,
            self.config.store.target_capacity,
            self.config.undo_scope
        );

        if let Some(hub) = self.hub_task.take() {
            tokio::spawn(hub.run());
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> ConnResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let session_id = Uuid::new_v4();
        let Some(broadcast_rx) = shared
            .group
            .add_peer_bounded(SessionInfo::new(session_id, addr.to_string()), shared.max_sessions)
            .await
        else {
            log::warn!("Rejecting {addr}: session limit {} reached", shared.max_sessions);
            shared.stats.write().await.rejected_connections += 1;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Session {session_id} connected from {addr}");

        let result = Self::serve_session(
            session_id,
            &shared,
            &mut ws_sender,
            &mut ws_receiver,
            broadcast_rx,
        )
        .await;

        // Disconnect: stop sending, drop the pointer. The store is untouched.
        shared.group.remove_peer(&session_id).await;
        if let Err(e) = shared.presence.remove_cursor(session_id) {
            log::error!("Failed to broadcast cursor removal for {session_id}: {e}");
        }
        shared.stats.write().await.active_connections -= 1;
        log::info!("Session {session_id} disconnected");

        result
    }

    async fn serve_session(
        session_id: Uuid,
        shared: &Shared,
        ws_sender: &mut WsSink,
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        mut broadcast_rx: broadcast::Receiver<Outbound>,
    ) -> ConnResult {
        send(ws_sender, &SyncMessage::welcome(session_id, &shared.welcome)?).await?;
        send_snapshot(ws_sender, &shared.hub).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match SyncMessage::decode(&data) {
                                Ok(sync_msg) => {
                                    Self::dispatch(session_id, sync_msg, shared, ws_sender).await?;
                                }
                                Err(e) => {
                                    log::warn!("Ignoring undecodable frame from {session_id}: {e}");
                                    shared.stats.write().await.ignored_messages += 1;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Session {session_id} closed the connection");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error for {session_id}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                outbound = broadcast_rx.recv() => {
                    match outbound {
                        Ok(outbound) => {
                            if outbound.is_for(session_id) {
                                ws_sender
                                    .send(Message::Binary(outbound.frame.to_vec().into()))
                                    .await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session {session_id} lagged by {n} messages, resyncing");
                            shared.group.record_dropped(n);
                            // Skip the backlog and restart from the tail, then send
                            // a snapshot taken after the new subscription point.
                            broadcast_rx = broadcast_rx.resubscribe();
                            send_snapshot(ws_sender, &shared.hub).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Route one decoded client message.
    async fn dispatch(
        session_id: Uuid,
        msg: SyncMessage,
        shared: &Shared,
        ws_sender: &mut WsSink,
    ) -> ConnResult {
        match msg.msg_type {
            MessageType::RequestFull => {
                log::debug!("Session {session_id} requested a full resync");
                send_snapshot(ws_sender, &shared.hub).await?;
            }

            MessageType::Stroke => match msg.submission() {
                Ok(submit) => {
                    let ack = shared.hub.commit(session_id, submit).await?;
                    send(ws_sender, &SyncMessage::stroke_ack(&ack)?).await?;
                }
                Err(e) => {
                    // Without a token there is nothing to acknowledge.
                    log::warn!("Ignoring malformed stroke from {session_id}: {e}");
                    shared.stats.write().await.ignored_messages += 1;
                }
            },

            MessageType::Cursor => match msg.cursor_sample() {
                Ok(sample) => {
                    shared.presence.update_cursor(session_id, &sample)?;
                }
                Err(e) => log::debug!("Ignoring malformed cursor from {session_id}: {e}"),
            },

            MessageType::CursorRemove => {
                shared.presence.remove_cursor(session_id)?;
            }

            MessageType::Undo => {
                let request = if msg.payload.is_empty() {
                    Ok(UndoRequest::default())
                } else {
                    msg.undo_request()
                };
                match request {
                    Ok(request) => {
                        shared.hub.undo(session_id, request).await?;
                    }
                    Err(e) => log::warn!("Ignoring malformed undo from {session_id}: {e}"),
                }
            }

            MessageType::Ping => {
                send(ws_sender, &SyncMessage::pong(session_id)).await?;
            }

            other => {
                log::debug!("Ignoring unexpected {other:?} from {session_id}");
                shared.stats.write().await.ignored_messages += 1;
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle to the canvas hub (valid once `run` has spawned it).
    pub fn canvas(&self) -> CanvasHandle {
        self.shared.hub.clone()
    }

    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.shared.group
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> ConnResult {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn send_snapshot(ws_sender: &mut WsSink, hub: &CanvasHandle) -> ConnResult {
    let strokes = hub.snapshot().await?;
    send(ws_sender, &SyncMessage::init(&strokes)?).await
}
