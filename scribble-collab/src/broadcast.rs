//! Fan-out broadcast to connected sessions with backpressure.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers.
//! Each session gets an independent receiver that buffers up to `capacity`
//! frames; a session that falls further behind loses the oldest frames
//! and the server resyncs it with a fresh snapshot.
//!
//! Every frame carries its origin so a receiver can skip its own traffic:
//! "send to all except sender" is `broadcast_from`, "send to all" is
//! `broadcast_all`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters so the send path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A connected participant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    /// Peer socket address, for logs
    pub remote_addr: String,
}

impl SessionInfo {
    pub fn new(session_id: Uuid, remote_addr: impl Into<String>) -> Self {
        Self {
            session_id,
            remote_addr: remote_addr.into(),
        }
    }
}

/// One pre-encoded frame on the broadcast channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Sending session; `None` for server-originated frames meant for everyone
    pub origin: Option<Uuid>,
    pub frame: Arc<Vec<u8>>,
}

impl Outbound {
    /// Whether `session_id` should receive this frame.
    pub fn is_for(&self, session_id: Uuid) -> bool {
        self.origin != Some(session_id)
    }
}

/// The broadcast group shared by every session on the canvas.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,

    /// Connected sessions
    peers: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,

    /// Channel capacity (frames buffered per receiver)
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a session and return its receiver.
    pub async fn add_peer(&self, info: SessionInfo) -> broadcast::Receiver<Outbound> {
        let mut peers = self.peers.write().await;
        peers.insert(info.session_id, info);
        self.sender.subscribe()
    }

    /// Register a session unless `max` sessions are already present.
    ///
    /// The count and the insert happen under one write lock, so concurrent
    /// connections cannot push the group past `max`.
    pub async fn add_peer_bounded(
        &self,
        info: SessionInfo,
        max: usize,
    ) -> Option<broadcast::Receiver<Outbound>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max {
            return None;
        }
        peers.insert(info.session_id, info);
        Some(self.sender.subscribe())
    }

    /// Unregister a session.
    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<SessionInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(session_id)
    }

    /// Send to every session except `origin`.
    ///
    /// Returns the number of receivers the frame was queued for (the origin's
    /// own receiver included; it filters the frame out on read).
    pub fn broadcast_from(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Outbound {
            origin: Some(origin),
            frame,
        }))
    }

    /// Send to every session.
    pub fn broadcast_all(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Outbound {
            origin: None,
            frame,
        }))
    }

    /// Broadcast a pre-encoded frame. Never blocks.
    pub fn broadcast_raw(&self, outbound: Outbound) -> usize {
        let count = self.sender.send(outbound).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<SessionInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without registering a session (observers, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let session = Uuid::new_v4();

        let _rx = group.add_peer(SessionInfo::new(session, "127.0.0.1:1")).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&session).await);

        let removed = group.remove_peer(&session).await.unwrap();
        assert_eq!(removed.remote_addr, "127.0.0.1:1");
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&session).await);
    }

    #[tokio::test]
    async fn test_bounded_add_never_exceeds_limit() {
        let group = Arc::new(BroadcastGroup::new(16));

        let mut joins = Vec::new();
        for i in 0..20 {
            let group = group.clone();
            joins.push(tokio::spawn(async move {
                let info = SessionInfo::new(Uuid::new_v4(), format!("127.0.0.1:{i}"));
                group.add_peer_bounded(info, 5).await.is_some()
            }));
        }

        let mut admitted = 0;
        for join in joins {
            if join.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(group.peer_count().await, 5);

        let extra = SessionInfo::new(Uuid::new_v4(), "127.0.0.1:99");
        assert!(group.add_peer_bounded(extra, 5).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_from_skips_origin() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_peer(SessionInfo::new(alice, "a")).await;
        let mut rx_bob = group.add_peer(SessionInfo::new(bob, "b")).await;

        let count = group
            .broadcast_from(alice, &SyncMessage::cursor_remove(alice))
            .unwrap();
        assert_eq!(count, 2);

        let for_alice = rx_alice.recv().await.unwrap();
        let for_bob = rx_bob.recv().await.unwrap();
        assert!(!for_alice.is_for(alice));
        assert!(for_bob.is_for(bob));

        let decoded = SyncMessage::decode(&for_bob.frame).unwrap();
        assert_eq!(decoded.msg_type, MessageType::CursorRemove);
        assert_eq!(decoded.session_id, alice);
    }

    #[tokio::test]
    async fn test_broadcast_all_reaches_everyone() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let mut rx = group.add_peer(SessionInfo::new(alice, "a")).await;

        group.broadcast_all(&SyncMessage::init(&[]).unwrap()).unwrap();

        let outbound = rx.recv().await.unwrap();
        assert!(outbound.origin.is_none());
        assert!(outbound.is_for(alice));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_is_harmless() {
        let group = BroadcastGroup::new(4);
        let count = group.broadcast_all(&SyncMessage::request_full()).unwrap();
        assert_eq!(count, 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_skipped() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();

        for _ in 0..5 {
            group.broadcast_all(&SyncMessage::request_full()).unwrap();
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().await.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let session = Uuid::new_v4();
        let _rx = group.add_peer(SessionInfo::new(session, "a")).await;

        group.broadcast_from(session, &SyncMessage::ping(session)).unwrap();
        group.broadcast_from(session, &SyncMessage::ping(session)).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_peer(SessionInfo::new(Uuid::new_v4(), "alice")).await;
        let _rx2 = group.add_peer(SessionInfo::new(Uuid::new_v4(), "bob")).await;

        let peers = group.peers().await;
        assert_eq!(peers.len(), 2);
        let addrs: Vec<&str> = peers.iter().map(|p| p.remote_addr.as_str()).collect();
        assert!(addrs.contains(&"alice"));
        assert!(addrs.contains(&"bob"));
    }
}
