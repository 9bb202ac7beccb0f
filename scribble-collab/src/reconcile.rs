//! Client-side mirror of the stroke log plus locally predicted strokes.
//!
//! ## State machine
//!
//! ```text
//!          begin_stroke                finish_stroke
//!   Idle ───────────────► Drawing ──────────────────► Idle
//!    ▲                      │  extend_stroke            (entry now Pending,
//!    └──── cancel_stroke ───┘                           awaiting its ack)
//!
//!   Pending ── ack Committed{id} ──► Committed
//!   Pending ── ack Rejected ───────► Rejected (kept until the next snapshot)
//! ```
//!
//! The gesture in progress is held apart from the mirror and drawn on top
//! of it. A snapshot replaces the mirror exactly; the gesture is untouched,
//! since it has not been submitted yet.

use std::time::Instant;

use uuid::Uuid;

use crate::client::SyncEvent;
use crate::presence::PresenceTable;
use crate::protocol::{AckOutcome, Brush, StrokeAck, StrokeSubmit};
use crate::stroke::{Stroke, StrokePayload, Vec2};

/// Where a mirror entry stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Local gesture in progress
    Drawing { token: u64 },
    /// Submitted, no ack yet
    Pending { token: u64 },
    /// Known to the server under this id
    Committed { id: u64 },
    /// Server refused it; never gets an id
    Rejected { token: u64 },
}

/// One stroke as this client sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorStroke {
    pub status: EntryStatus,
    /// `None` for local entries until the server says otherwise
    pub author_id: Option<Uuid>,
    pub points: Vec<Vec2>,
    pub color: String,
    pub stroke_width: f32,
    pub is_eraser: bool,
}

impl MirrorStroke {
    pub fn id(&self) -> Option<u64> {
        match self.status {
            EntryStatus::Committed { id } => Some(id),
            _ => None,
        }
    }

    fn token(&self) -> Option<u64> {
        match self.status {
            EntryStatus::Drawing { token }
            | EntryStatus::Pending { token }
            | EntryStatus::Rejected { token } => Some(token),
            EntryStatus::Committed { .. } => None,
        }
    }
}

impl From<Stroke> for MirrorStroke {
    fn from(stroke: Stroke) -> Self {
        Self {
            status: EntryStatus::Committed { id: stroke.id },
            author_id: Some(stroke.author_id),
            points: stroke.points,
            color: stroke.color,
            stroke_width: stroke.stroke_width,
            is_eraser: stroke.is_eraser,
        }
    }
}

/// Local drawing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawState {
    Idle,
    Drawing { token: u64 },
}

/// Converges a local canvas with the server's stroke log.
#[derive(Debug)]
pub struct Reconciler {
    mirror: Vec<MirrorStroke>,
    /// Gesture in progress, not yet part of the mirror
    current: Option<MirrorStroke>,
    next_token: u64,
    session_id: Option<Uuid>,
    presence: PresenceTable,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            mirror: Vec::new(),
            current: None,
            next_token: 1,
            session_id: None,
            presence: PresenceTable::default(),
        }
    }

    /// Start a local stroke and show it immediately.
    ///
    /// Returns the correlation token, or `None` if a stroke is already in
    /// progress.
    pub fn begin_stroke(&mut self, start: Vec2, brush: &Brush) -> Option<u64> {
        if self.current.is_some() {
            log::debug!("Ignoring stroke start while already drawing");
            return None;
        }

        let token = self.next_token;
        self.next_token += 1;
        self.current = Some(MirrorStroke {
            status: EntryStatus::Drawing { token },
            author_id: self.session_id,
            points: vec![start],
            color: brush.color.clone(),
            stroke_width: brush.size,
            is_eraser: brush.is_eraser,
        });
        Some(token)
    }

    /// Append a sample to the stroke in progress. Returns false when idle.
    pub fn extend_stroke(&mut self, point: Vec2) -> bool {
        match self.current.as_mut() {
            Some(entry) => {
                entry.points.push(point);
                true
            }
            None => false,
        }
    }

    /// Finish the stroke in progress and produce its submission.
    pub fn finish_stroke(&mut self) -> Option<StrokeSubmit> {
        let mut entry = self.current.take()?;
        let token = entry.token()?;
        entry.status = EntryStatus::Pending { token };

        let submit = StrokeSubmit {
            token,
            stroke: StrokePayload {
                points: entry.points.clone(),
                color: Some(entry.color.clone()),
                stroke_width: Some(entry.stroke_width),
                is_eraser: entry.is_eraser,
            },
        };
        self.mirror.push(entry);
        Some(submit)
    }

    /// Abandon the stroke in progress without submitting it.
    pub fn cancel_stroke(&mut self) -> bool {
        self.current.take().is_some()
    }

    /// Settle a pending entry. Returns false for unknown tokens (for
    /// example when a snapshot already discarded the entry).
    pub fn apply_ack(&mut self, ack: &StrokeAck) -> bool {
        let token = ack.token;
        let Some(entry) = self
            .mirror
            .iter_mut()
            .find(|e| e.status == EntryStatus::Pending { token })
        else {
            log::debug!("Ack for unknown token {token}");
            return false;
        };

        entry.status = match &ack.outcome {
            AckOutcome::Committed { id } => EntryStatus::Committed { id: *id },
            AckOutcome::Rejected { reason } => {
                log::warn!("Stroke {token} rejected: {reason}");
                EntryStatus::Rejected { token }
            }
        };
        true
    }

    /// Add a stroke committed by someone else. Ids already present are
    /// skipped.
    pub fn apply_remote_stroke(&mut self, stroke: Stroke) -> bool {
        if self.contains_id(stroke.id) {
            log::trace!("Skipping duplicate stroke {}", stroke.id);
            return false;
        }
        self.mirror.push(stroke.into());
        true
    }

    /// Replace the mirror with the server's snapshot.
    pub fn apply_snapshot(&mut self, strokes: Vec<Stroke>) {
        let discarded = self.pending_count();
        if discarded > 0 {
            log::debug!("Snapshot discarded {discarded} unacknowledged strokes");
        }

        self.mirror = strokes.into_iter().map(MirrorStroke::from).collect();
    }

    /// Apply one client event as of `now`.
    pub fn handle_event_at(&mut self, event: SyncEvent, now: Instant) {
        match event {
            SyncEvent::Welcome { session_id, info } => {
                self.session_id = Some(session_id);
                self.presence = PresenceTable::new(std::time::Duration::from_millis(
                    info.presence_ttl_ms,
                ));
                self.presence.set_local_session(session_id);
            }
            SyncEvent::Snapshot(strokes) => self.apply_snapshot(strokes),
            SyncEvent::RemoteStroke(stroke) => {
                self.apply_remote_stroke(stroke);
            }
            SyncEvent::StrokeAck(ack) => {
                self.apply_ack(&ack);
            }
            SyncEvent::RemoteCursor { session_id, sample } => {
                self.presence.apply_cursor(session_id, sample, now);
            }
            SyncEvent::CursorRemoved(session_id) => {
                self.presence.apply_remove(session_id);
            }
            SyncEvent::Disconnected => self.presence.clear(),
            SyncEvent::Connected | SyncEvent::Pong => {}
        }
    }

    pub fn handle_event(&mut self, event: SyncEvent) {
        self.handle_event_at(event, Instant::now());
    }

    /// Submitted and remote entries in display order.
    pub fn strokes(&self) -> &[MirrorStroke] {
        &self.mirror
    }

    /// The gesture in progress, drawn above `strokes()`.
    pub fn current_stroke(&self) -> Option<&MirrorStroke> {
        self.current.as_ref()
    }

    /// Ids of committed entries, in mirror order.
    pub fn committed_ids(&self) -> Vec<u64> {
        self.mirror.iter().filter_map(MirrorStroke::id).collect()
    }

    /// Submitted strokes still waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.mirror
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Pending { .. }))
            .count()
    }

    pub fn state(&self) -> DrawState {
        match self.current.as_ref().and_then(MirrorStroke::token) {
            Some(token) => DrawState::Drawing { token },
            None => DrawState::Idle,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceTable {
        &mut self.presence
    }

    fn contains_id(&self, id: u64) -> bool {
        self.mirror.iter().any(|e| e.id() == Some(id))
    }
}
