//! Single-mutator task that owns the stroke log.
//!
//! ```text
//! connection task ──┐
//! connection task ──┼── mpsc<HubCommand> ──► CanvasHub::run()
//! connection task ──┘        ▲                   │  owns StrokeStore
//!                            │                   │  owns UndoCoordinator
//!                     oneshot replies            ▼
//!                                         BroadcastGroup (fire-and-forget)
//! ```
//!
//! Commands are handled strictly one at a time in receipt order, so the
//! store needs no lock. Fan-out goes through a tokio broadcast channel and
//! never blocks the hub.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{ProtocolError, StrokeAck, StrokeSubmit, SyncMessage, UndoRequest};
use crate::store::{StoreStats, StrokeStore};
use crate::stroke::{Stroke, UndoScope};
use crate::undo::UndoCoordinator;

/// Commands queue depth before senders wait.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Work item for the hub.
#[derive(Debug)]
pub enum HubCommand {
    /// Full ordered snapshot for `init`
    Snapshot { reply: oneshot::Sender<Vec<Stroke>> },
    /// Commit a stroke, broadcast it to everyone but the author, ack the author
    Commit {
        author: Uuid,
        submit: StrokeSubmit,
        reply: oneshot::Sender<StrokeAck>,
    },
    /// Remove one stroke and resync everyone
    Undo {
        requester: Uuid,
        request: UndoRequest,
        reply: oneshot::Sender<Option<Stroke>>,
    },
    Stats { reply: oneshot::Sender<StoreStats> },
}

/// Owner of the authoritative store.
pub struct CanvasHub {
    store: StrokeStore,
    undo: UndoCoordinator,
    group: Arc<BroadcastGroup>,
    rx: mpsc::Receiver<HubCommand>,
}

impl CanvasHub {
    /// Build a hub and the handle used to talk to it.
    pub fn new(
        store: StrokeStore,
        undo_scope: UndoScope,
        group: Arc<BroadcastGroup>,
    ) -> (Self, CanvasHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let hub = Self {
            store,
            undo: UndoCoordinator::new(undo_scope, group.clone()),
            group,
            rx,
        };
        (hub, CanvasHandle { tx })
    }

    /// Build a hub and run it on the current tokio runtime.
    pub fn spawn(
        store: StrokeStore,
        undo_scope: UndoScope,
        group: Arc<BroadcastGroup>,
    ) -> CanvasHandle {
        let (hub, handle) = Self::new(store, undo_scope, group);
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        log::info!("Canvas hub stopped with {} strokes", self.store.len());
    }

    fn handle(&mut self, cmd: HubCommand) {
        // A dropped reply receiver means the connection went away; the
        // mutation itself still stands.
        match cmd {
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
            HubCommand::Commit {
                author,
                submit,
                reply,
            } => {
                let ack = self.commit(author, submit);
                let _ = reply.send(ack);
            }
            HubCommand::Undo {
                requester,
                request,
                reply,
            } => {
                let removed = self.undo.undo(&mut self.store, requester, &request);
                let _ = reply.send(removed);
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.store.stats().clone());
            }
        }
    }

    fn commit(&mut self, author: Uuid, submit: StrokeSubmit) -> StrokeAck {
        let token = submit.token;
        match self.store.commit(submit.stroke, author) {
            Ok(stroke) => {
                log::debug!(
                    "Committed stroke {} from {author} ({} points)",
                    stroke.id,
                    stroke.points.len()
                );
                match SyncMessage::committed_stroke(&stroke) {
                    Ok(msg) => {
                        if let Err(e) = self.group.broadcast_from(author, &msg) {
                            log::error!("Failed to broadcast stroke {}: {e}", stroke.id);
                        }
                    }
                    Err(e) => log::error!("Failed to encode stroke {}: {e}", stroke.id),
                }
                StrokeAck::committed(token, stroke.id)
            }
            Err(e) => {
                log::warn!("Rejected stroke from {author}: {e}");
                StrokeAck::rejected(token, e.to_string())
            }
        }
    }
}

/// Cloneable sender side of the hub.
#[derive(Clone)]
pub struct CanvasHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl CanvasHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn snapshot(&self) -> Result<Vec<Stroke>, ProtocolError> {
        self.request(|reply| HubCommand::Snapshot { reply }).await
    }

    pub async fn commit(&self, author: Uuid, submit: StrokeSubmit) -> Result<StrokeAck, ProtocolError> {
        self.request(|reply| HubCommand::Commit {
            author,
            submit,
            reply,
        })
        .await
    }

    pub async fn undo(&self, requester: Uuid, request: UndoRequest) -> Result<Option<Stroke>, ProtocolError> {
        self.request(|reply| HubCommand::Undo {
            requester,
            request,
            reply,
        })
        .await
    }

    pub async fn store_stats(&self) -> Result<StoreStats, ProtocolError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::store::StoreConfig;
    use crate::stroke::{StrokePayload, Vec2};

    fn submit(token: u64) -> StrokeSubmit {
        StrokeSubmit {
            token,
            stroke: StrokePayload::new(
                vec![Vec2::new(0.0, 0.0), Vec2::new(1.0, 1.0)],
                "#ff0000",
                6.0,
            ),
        }
    }

    fn spawn_hub(scope: UndoScope) -> (CanvasHandle, Arc<BroadcastGroup>) {
        let group = Arc::new(BroadcastGroup::new(64));
        let handle = CanvasHub::spawn(StrokeStore::with_defaults(), scope, group.clone());
        (handle, group)
    }

    #[tokio::test]
    async fn test_commit_acks_with_token_and_id() {
        let (hub, _group) = spawn_hub(UndoScope::Global);
        let author = Uuid::new_v4();

        let first = hub.commit(author, submit(10)).await.unwrap();
        let second = hub.commit(author, submit(11)).await.unwrap();

        assert_eq!(first, StrokeAck::committed(10, 1));
        assert_eq!(second, StrokeAck::committed(11, 2));
    }

    #[tokio::test]
    async fn test_rejected_commit_keeps_token() {
        let (hub, _group) = spawn_hub(UndoScope::Global);
        let mut bad = submit(3);
        bad.stroke.points.clear();

        let ack = hub.commit(Uuid::new_v4(), bad).await.unwrap();

        assert_eq!(ack.token, 3);
        assert!(!ack.is_ok());
        assert!(hub.snapshot().await.unwrap().is_empty());
        assert_eq!(hub.store_stats().await.unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn test_commit_broadcasts_to_others() {
        let (hub, group) = spawn_hub(UndoScope::Global);
        let mut rx = group.subscribe();
        let author = Uuid::new_v4();

        hub.commit(author, submit(1)).await.unwrap();

        let outbound = rx.recv().await.unwrap();
        assert_eq!(outbound.origin, Some(author));
        let msg = SyncMessage::decode(&outbound.frame).unwrap();
        assert_eq!(msg.msg_type, MessageType::Stroke);
        assert_eq!(msg.stroke().unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_undo_through_hub() {
        let (hub, _group) = spawn_hub(UndoScope::Global);
        let author = Uuid::new_v4();
        hub.commit(author, submit(1)).await.unwrap();
        hub.commit(author, submit(2)).await.unwrap();

        let removed = hub.undo(author, UndoRequest::default()).await.unwrap();
        assert_eq!(removed.map(|s| s.id), Some(2));

        let ids: Vec<u64> = hub.snapshot().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);

        // Empty-handed undo afterwards on a per-author basis for a stranger.
        let request = UndoRequest {
            scope: Some(UndoScope::PerAuthor),
            author_id: None,
        };
        assert!(hub.undo(Uuid::new_v4(), request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_commits_get_unique_ids() {
        let (hub, _group) = spawn_hub(UndoScope::Global);

        let mut tasks = Vec::new();
        for token in 0..50u64 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                hub.commit(Uuid::new_v4(), submit(token)).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().id().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&50));
    }

    #[tokio::test]
    async fn test_hub_prunes_with_custom_capacity() {
        let group = Arc::new(BroadcastGroup::new(16));
        let store = StrokeStore::new(StoreConfig::new(5, 3).unwrap()).unwrap();
        let hub = CanvasHub::spawn(store, UndoScope::Global, group);

        for token in 0..6 {
            hub.commit(Uuid::new_v4(), submit(token)).await.unwrap();
        }

        let ids: Vec<u64> = hub.snapshot().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_handle_fails_after_hub_stops() {
        let group = Arc::new(BroadcastGroup::new(4));
        let (hub, handle) = CanvasHub::new(StrokeStore::with_defaults(), UndoScope::Global, group);
        drop(hub);

        assert!(matches!(
            handle.snapshot().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
