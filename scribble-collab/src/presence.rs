//! Live pointer presence: ephemeral, never part of the stroke log.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! CursorThrottle::sample()        (rate-limited, default 80ms)
//!       │
//!       ▼   Cursor frame
//! PresenceBroadcaster (server)    (tag with session, fan out to others)
//!       │
//!       ▼
//! PresenceTable (each client)     (last_seen bookkeeping, TTL on read)
//! ```
//!
//! Nobody runs an expiry timer. The sender never tracks liveness; each
//! consumer decides for itself whether `now - last_seen > ttl`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{Brush, CursorSample, ProtocolError, SyncMessage};
use crate::stroke::Vec2;

/// Presence records older than this are not live (4s).
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_millis(4000);

/// Minimum spacing between outgoing cursor samples (~12.5Hz).
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(80);

// ───────────────────────────────────────────────────────────────────
// Server side
// ───────────────────────────────────────────────────────────────────

/// Relays pointer samples to every other session.
///
/// Holds no presence state at all: a sample is tagged with its session,
/// fanned out and forgotten.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    group: Arc<BroadcastGroup>,
}

impl PresenceBroadcaster {
    pub fn new(group: Arc<BroadcastGroup>) -> Self {
        Self { group }
    }

    /// Fan out a pointer sample from `session_id`.
    pub fn update_cursor(&self, session_id: Uuid, sample: &CursorSample) -> Result<usize, ProtocolError> {
        log::trace!("Presence: cursor from {session_id}");
        let msg = SyncMessage::cursor(session_id, sample)?;
        self.group.broadcast_from(session_id, &msg)
    }

    /// Fan out a removal hint (pointer released or session gone).
    pub fn remove_cursor(&self, session_id: Uuid) -> Result<usize, ProtocolError> {
        log::debug!("Presence: cursor removed for {session_id}");
        self.group
            .broadcast_from(session_id, &SyncMessage::cursor_remove(session_id))
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side
// ───────────────────────────────────────────────────────────────────

/// A remote pointer as last seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub session_id: Uuid,
    pub position: Vec2,
    pub brush: Brush,
    pub last_seen: Instant,
}

impl PresenceRecord {
    /// Live while `now - last_seen <= ttl`.
    pub fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= ttl
    }
}

/// Remote pointers known to one client.
#[derive(Debug)]
pub struct PresenceTable {
    records: HashMap<Uuid, PresenceRecord>,
    ttl: Duration,
    /// Samples tagged with our own session are ignored
    local_session: Option<Uuid>,
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

impl PresenceTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: HashMap::new(),
            ttl,
            local_session: None,
        }
    }

    /// Remember which session is ours once the server has told us.
    pub fn set_local_session(&mut self, session_id: Uuid) {
        self.local_session = Some(session_id);
        self.records.remove(&session_id);
    }

    /// Record a sample received at `now`.
    pub fn apply_cursor(&mut self, session_id: Uuid, sample: CursorSample, now: Instant) {
        if self.local_session == Some(session_id) {
            return;
        }
        self.records.insert(
            session_id,
            PresenceRecord {
                session_id,
                position: sample.position,
                brush: sample.brush,
                last_seen: now,
            },
        );
    }

    /// Drop a session's pointer. Returns whether it was known.
    pub fn apply_remove(&mut self, session_id: Uuid) -> bool {
        self.records.remove(&session_id).is_some()
    }

    /// Live pointers as of `now`, ordered by session id for stable output.
    pub fn live_at(&self, now: Instant) -> Vec<&PresenceRecord> {
        let mut live: Vec<&PresenceRecord> = self
            .records
            .values()
            .filter(|r| r.is_live(now, self.ttl))
            .collect();
        live.sort_by_key(|r| r.session_id);
        live
    }

    /// Live pointers as of now.
    pub fn live(&self) -> Vec<&PresenceRecord> {
        self.live_at(Instant::now())
    }

    /// Forget records that are no longer live. Returns the forgotten sessions.
    pub fn cleanup_stale_at(&mut self, now: Instant) -> Vec<Uuid> {
        let ttl = self.ttl;
        let stale: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| !r.is_live(now, ttl))
            .map(|r| r.session_id)
            .collect();
        for id in &stale {
            self.records.remove(id);
        }
        stale
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&PresenceRecord> {
        self.records.get(session_id)
    }

    /// Number of records held, live or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Rate limiter for outgoing cursor samples.
#[derive(Debug)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL)
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Return a sample to send, or `None` if throttled.
    pub fn sample(&mut self, position: Vec2, brush: &Brush, now: Instant) -> Option<CursorSample> {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        Some(self.force(position, brush, now))
    }

    /// Always produce a sample (pointer down, brush change).
    pub fn force(&mut self, position: Vec2, brush: &Brush, now: Instant) -> CursorSample {
        self.last_sent = Some(now);
        CursorSample {
            position,
            brush: brush.clone(),
        }
    }

    /// Forget the last send so the next sample goes out immediately.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}
