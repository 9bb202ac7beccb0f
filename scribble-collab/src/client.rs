//! WebSocket sync client for connecting to the canvas server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with full resync)
//! - Stroke submission and acknowledgement delivery
//! - Cursor presence send/receive
//!
//! The client holds no canvas state. Decoded server frames are surfaced as
//! [`SyncEvent`]s for a [`Reconciler`](crate::reconcile::Reconciler) or any
//! other consumer.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    CursorSample, MessageType, ProtocolError, StrokeAck, StrokeSubmit, SyncMessage, UndoRequest,
    Welcome,
};
use crate::stroke::Stroke;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Server assigned our session id
    Welcome { session_id: Uuid, info: Welcome },
    /// Full authoritative stroke list
    Snapshot(Vec<Stroke>),
    /// Stroke committed by another participant
    RemoteStroke(Stroke),
    /// Outcome of one of our submissions
    StrokeAck(StrokeAck),
    /// Another participant's pointer moved
    RemoteCursor { session_id: Uuid, sample: CursorSample },
    /// Another participant's pointer went away
    CursorRemoved(Uuid),
    Pong,
}

impl SyncEvent {
    /// Map a decoded server frame to an event.
    ///
    /// Returns `None` for client→server-only types and malformed payloads.
    pub fn from_message(msg: &SyncMessage) -> Option<Self> {
        let event = match msg.msg_type {
            MessageType::Welcome => msg.welcome_info().map(|info| SyncEvent::Welcome {
                session_id: msg.session_id,
                info,
            }),
            MessageType::Init => msg.snapshot().map(SyncEvent::Snapshot),
            MessageType::Stroke => msg.stroke().map(SyncEvent::RemoteStroke),
            MessageType::StrokeAck => msg.ack().map(SyncEvent::StrokeAck),
            MessageType::Cursor => msg.cursor_sample().map(|sample| SyncEvent::RemoteCursor {
                session_id: msg.session_id,
                sample,
            }),
            MessageType::CursorRemove => Ok(SyncEvent::CursorRemoved(msg.session_id)),
            MessageType::Pong => Ok(SyncEvent::Pong),
            MessageType::RequestFull | MessageType::Undo | MessageType::Ping => return None,
        };

        match event {
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("Dropping malformed {:?} frame: {e}", msg.msg_type);
                None
            }
        }
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the canvas server. Every successful
/// `connect` asks for a full snapshot, so reconnecting is also a resync.
pub struct SyncClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Session id assigned by the server, once welcomed
    session_id: Arc<RwLock<Option<Uuid>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// requests a full snapshot.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let was_welcomed = self.session_id.read().await.is_some();
        *self.state.write().await = if was_welcomed {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when
        // the channel is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {}", self.server_url);

        // Reader task: decode frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(sync_msg) => sync_msg,
                            Err(e) => {
                                log::debug!("Ignoring undecodable frame: {e}");
                                continue;
                            }
                        };
                        let Some(event) = SyncEvent::from_message(&sync_msg) else {
                            continue;
                        };
                        if let SyncEvent::Welcome { session_id: id, .. } = &event {
                            *session_id.write().await = Some(*id);
                        }
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.request_full().await
    }

    /// Close the connection. Pending writes are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn envelope_session(&self) -> Uuid {
        (*self.session_id.read().await).unwrap_or_else(Uuid::nil)
    }

    /// Submit a finished stroke. The outcome arrives as [`SyncEvent::StrokeAck`].
    pub async fn submit_stroke(&self, submit: &StrokeSubmit) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::submit_stroke(submit)?).await
    }

    /// Send a pointer sample. Silently dropped while offline.
    pub async fn send_cursor(&self, sample: &CursorSample) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let msg = SyncMessage::cursor(self.envelope_session().await, sample)?;
        self.send(&msg).await
    }

    /// Tell others our pointer is gone (pointer released).
    pub async fn send_cursor_remove(&self) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let msg = SyncMessage::cursor_remove(self.envelope_session().await);
        self.send(&msg).await
    }

    /// Ask for a fresh snapshot.
    pub async fn request_full(&self) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::request_full()).await
    }

    /// Ask the server to undo one stroke.
    pub async fn undo(&self, request: &UndoRequest) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::undo(request)?).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.envelope_session().await);
        self.send(&msg).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Session id from the most recent `Welcome`.
    pub async fn session_id(&self) -> Option<Uuid> {
        *self.session_id.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Brush;
    use crate::stroke::{StrokePayload, UndoScope, Vec2};

    fn sample() -> CursorSample {
        CursorSample {
            position: Vec2::new(10.0, 20.0),
            brush: Brush::default(),
        }
    }

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:9090");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_submit_offline_fails() {
        let client = SyncClient::new("ws://localhost:9090");
        let submit = StrokeSubmit {
            token: 1,
            stroke: StrokePayload::new(vec![Vec2::ZERO], "#000000", 4.0),
        };
        assert!(matches!(
            client.submit_stroke(&submit).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(client.request_full().await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_offline_noop() {
        let client = SyncClient::new("ws://localhost:9090");
        client.send_cursor(&sample()).await.unwrap();
        client.send_cursor_remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is reserved and nothing listens there.
        let mut client = SyncClient::new("ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_event_from_welcome() {
        let session = Uuid::new_v4();
        let info = Welcome {
            presence_ttl_ms: 4000,
            undo_scope: UndoScope::PerAuthor,
        };
        let msg = SyncMessage::welcome(session, &info).unwrap();

        assert_eq!(
            SyncEvent::from_message(&msg),
            Some(SyncEvent::Welcome {
                session_id: session,
                info
            })
        );
    }

    #[test]
    fn test_event_from_cursor_frames() {
        let peer = Uuid::new_v4();
        let cursor = SyncMessage::cursor(peer, &sample()).unwrap();
        assert_eq!(
            SyncEvent::from_message(&cursor),
            Some(SyncEvent::RemoteCursor {
                session_id: peer,
                sample: sample()
            })
        );

        let removed = SyncMessage::cursor_remove(peer);
        assert_eq!(
            SyncEvent::from_message(&removed),
            Some(SyncEvent::CursorRemoved(peer))
        );
    }

    #[test]
    fn test_event_from_ack_and_pong() {
        let ack = SyncMessage::stroke_ack(&StrokeAck::committed(7, 3)).unwrap();
        assert_eq!(
            SyncEvent::from_message(&ack),
            Some(SyncEvent::StrokeAck(StrokeAck::committed(7, 3)))
        );
        assert_eq!(
            SyncEvent::from_message(&SyncMessage::pong(Uuid::nil())),
            Some(SyncEvent::Pong)
        );
    }

    #[test]
    fn test_client_only_frames_are_not_events() {
        assert!(SyncEvent::from_message(&SyncMessage::request_full()).is_none());
        assert!(SyncEvent::from_message(&SyncMessage::ping(Uuid::nil())).is_none());
        let undo = SyncMessage::undo(&UndoRequest::default()).unwrap();
        assert!(SyncEvent::from_message(&undo).is_none());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let mut msg = SyncMessage::stroke_ack(&StrokeAck::committed(1, 1)).unwrap();
        msg.payload = vec![0xff];
        assert!(SyncEvent::from_message(&msg).is_none());
    }
}
