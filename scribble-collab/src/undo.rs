//! Undo: remove one stroke under a scope policy, then resync everyone.
//!
//! There is no incremental "stroke removed" event. A successful undo is
//! always announced as a full `Init` snapshot to every session, which also
//! discards any unacknowledged strokes on the receiving clients.

use std::sync::Arc;

use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{ProtocolError, SyncMessage, UndoRequest};
use crate::store::StrokeStore;
use crate::stroke::{Stroke, UndoScope};

pub struct UndoCoordinator {
    default_scope: UndoScope,
    group: Arc<BroadcastGroup>,
}

impl UndoCoordinator {
    pub fn new(default_scope: UndoScope, group: Arc<BroadcastGroup>) -> Self {
        Self {
            default_scope,
            group,
        }
    }

    /// Scope and author the request resolves to.
    ///
    /// Request fields win; otherwise the configured scope and the
    /// requesting session apply.
    pub fn resolve(&self, requester: Uuid, request: &UndoRequest) -> (UndoScope, Uuid) {
        (
            request.scope.unwrap_or(self.default_scope),
            request.author_id.unwrap_or(requester),
        )
    }

    /// Apply an undo request against the store.
    ///
    /// Returns the removed stroke. Nothing is broadcast when nothing matched.
    /// The stroke is gone from the store even if the resync broadcast fails,
    /// so the failure is logged and the removal still reported.
    pub fn undo(
        &self,
        store: &mut StrokeStore,
        requester: Uuid,
        request: &UndoRequest,
    ) -> Option<Stroke> {
        let (scope, author) = self.resolve(requester, request);

        let Some(removed) = store.remove_last(scope, author) else {
            log::debug!("Undo ({scope}) by {requester}: nothing to remove");
            return None;
        };

        log::info!(
            "Undo ({scope}) by {requester}: removed stroke {} by {}",
            removed.id,
            removed.author_id
        );

        if let Err(e) = self.resync(store) {
            log::error!("Undo resync broadcast failed after removing {}: {e}", removed.id);
        }

        Some(removed)
    }

    /// Broadcast the full snapshot to every session.
    pub fn resync(&self, store: &StrokeStore) -> Result<usize, ProtocolError> {
        let snapshot = SyncMessage::init(&store.snapshot())?;
        self.group.broadcast_all(&snapshot)
    }

    pub fn default_scope(&self) -> UndoScope {
        self.default_scope
    }
}
