//! # scribble-collab: Shared canvas stroke log and its sync protocol
//!
//! One server owns the authoritative list of committed strokes. Clients
//! draw optimistically, submit finished strokes, and converge on the
//! server's log through acks, relayed strokes and full snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Reconciler  │                     │ CanvasHub   │
//! │ (mirror)    │                     │ StrokeStore │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`stroke`]: Stroke data model and undo scope
//! - [`store`]: Authoritative stroke log with id assignment and pruning
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Session fan-out with origin filtering
//! - [`hub`]: Single task that owns the store
//! - [`undo`]: Scoped undo with full resync
//! - [`presence`]: Ephemeral pointer relay and client-side TTL table
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`reconcile`]: Client mirror with optimistic strokes

pub mod stroke;
pub mod store;
pub mod protocol;
pub mod broadcast;
pub mod hub;
pub mod undo;
pub mod presence;
pub mod server;
pub mod client;
pub mod reconcile;

// Re-exports for convenience
pub use stroke::{Stroke, StrokePayload, UndoScope, Vec2};
pub use store::{StoreConfig, StoreError, StoreStats, StrokeStore};
pub use protocol::{
    AckOutcome, Brush, CursorSample, MessageType, ProtocolError, StrokeAck, StrokeSubmit,
    SyncMessage, UndoRequest, Welcome,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound, SessionInfo};
pub use hub::{CanvasHandle, CanvasHub};
pub use undo::UndoCoordinator;
pub use presence::{CursorThrottle, PresenceBroadcaster, PresenceRecord, PresenceTable};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use reconcile::{DrawState, EntryStatus, MirrorStroke, Reconciler};
