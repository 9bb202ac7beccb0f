//! Authoritative, append-mostly stroke log.
//!
//! ```text
//! commit(payload) ──► validate ──► id = next_id++ ──► insert ──► prune
//!                                                                  │
//!                  len > max_capacity ? evict oldest until len == target
//! ```
//!
//! Ids come from a counter that is never reset, so ids only ever skip
//! (because of pruning or undo) and are never reused.
//!
//! ## Retention
//!
//! The store is bounded. Once it holds more than `max_capacity` strokes the
//! oldest ones (lowest ids) are evicted until `target_capacity` remain. Those
//! strokes silently disappear from every participant's canvas on the next
//! snapshot. This is a retention bound, not data loss caused by a bug.
//!
//! The store never talks to the network. It is owned by exactly one task
//! (see [`crate::hub`]), which serializes every mutation.

use std::collections::BTreeMap;
use std::time::SystemTime;

use thiserror::Error;
use uuid::Uuid;

use crate::stroke::{Stroke, StrokePayload, UndoScope, DEFAULT_COLOR, DEFAULT_STROKE_WIDTH};

/// Store errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Payload rejected before any mutation took place.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    /// Capacity or width bounds that cannot be satisfied.
    #[error("Invalid store config: {0}")]
    InvalidConfig(String),
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Upper bound on retained strokes (default: 5000)
    pub max_capacity: usize,
    /// Size the store is pruned down to once `max_capacity` is exceeded (default: 4000)
    pub target_capacity: usize,
    /// Inclusive clamp applied to every committed stroke width (default: [1, 200])
    pub stroke_width_bounds: (f32, f32),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_capacity: 5000,
            target_capacity: 4000,
            stroke_width_bounds: (1.0, 200.0),
        }
    }
}

impl StoreConfig {
    /// Create a validated config with the default width bounds.
    pub fn new(max_capacity: usize, target_capacity: usize) -> Result<Self, StoreError> {
        let config = Self {
            max_capacity,
            target_capacity,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check `1 <= target <= max` and `1 <= min_width <= max_width`.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.target_capacity == 0 || self.target_capacity > self.max_capacity {
            return Err(StoreError::InvalidConfig(format!(
                "target capacity {} must be within 1..={}",
                self.target_capacity, self.max_capacity
            )));
        }
        let (lo, hi) = self.stroke_width_bounds;
        if !(lo.is_finite() && hi.is_finite()) || lo <= 0.0 || lo > hi {
            return Err(StoreError::InvalidConfig(format!(
                "stroke width bounds [{lo}, {hi}] are not a positive range"
            )));
        }
        Ok(())
    }

    /// Clamp a requested width into the configured bounds.
    ///
    /// Absent or non-finite widths fall back to the default before clamping.
    pub fn clamp_width(&self, requested: Option<f32>) -> f32 {
        let (lo, hi) = self.stroke_width_bounds;
        let width = requested
            .filter(|w| w.is_finite())
            .unwrap_or(DEFAULT_STROKE_WIDTH);
        width.clamp(lo, hi)
    }
}

/// Counters for monitoring store churn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub committed: u64,
    pub rejected: u64,
    pub removed: u64,
    pub pruned: u64,
}

/// The authoritative stroke log.
pub struct StrokeStore {
    /// Committed strokes keyed (and therefore ordered) by id
    strokes: BTreeMap<u64, Stroke>,
    /// Next id to hand out; never reset
    next_id: u64,
    config: StoreConfig,
    stats: StoreStats,
}

impl StrokeStore {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            strokes: BTreeMap::new(),
            next_id: 1,
            config,
            stats: StoreStats::default(),
        })
    }

    /// Create with default configuration (5000 / 4000, widths [1, 200]).
    pub fn with_defaults() -> Self {
        Self {
            strokes: BTreeMap::new(),
            next_id: 1,
            config: StoreConfig::default(),
            stats: StoreStats::default(),
        }
    }

    /// Validate and commit a stroke, then apply the capacity bound.
    ///
    /// Nothing is mutated when the payload is rejected.
    pub fn commit(&mut self, payload: StrokePayload, author_id: Uuid) -> Result<Stroke, StoreError> {
        if let Err(e) = Self::check_points(&payload) {
            self.stats.rejected += 1;
            return Err(e);
        }

        let id = self.next_id;
        self.next_id += 1;

        let stroke = Stroke {
            id,
            author_id,
            stroke_width: self.config.clamp_width(payload.stroke_width),
            color: payload
                .color
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            is_eraser: payload.is_eraser,
            points: payload.points,
            created_at: unix_millis(),
        };

        self.strokes.insert(id, stroke.clone());
        self.stats.committed += 1;
        self.prune();

        Ok(stroke)
    }

    fn check_points(payload: &StrokePayload) -> Result<(), StoreError> {
        if payload.points.is_empty() {
            return Err(StoreError::InvalidPayload("stroke has no points".into()));
        }
        if let Some(i) = payload.points.iter().position(|p| !p.is_finite()) {
            return Err(StoreError::InvalidPayload(format!(
                "point {i} has a non-finite coordinate"
            )));
        }
        Ok(())
    }

    /// Evict oldest strokes once `max_capacity` is exceeded.
    ///
    /// Returns the number of evicted strokes.
    fn prune(&mut self) -> usize {
        if self.strokes.len() <= self.config.max_capacity {
            return 0;
        }

        let excess = self.strokes.len() - self.config.target_capacity;
        for _ in 0..excess {
            self.strokes.pop_first();
        }
        self.stats.pruned += excess as u64;

        log::debug!(
            "Pruned {excess} oldest strokes, {} retained (oldest id now {:?})",
            self.strokes.len(),
            self.strokes.keys().next()
        );
        excess
    }

    /// Remove a stroke by id. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: u64) -> bool {
        let removed = self.strokes.remove(&id).is_some();
        if removed {
            self.stats.removed += 1;
        }
        removed
    }

    /// Remove the most recent stroke within `scope`.
    ///
    /// `Global` takes the highest id overall; `PerAuthor` the highest id
    /// drawn by `author_id`. Returns `None` when nothing matches.
    pub fn remove_last(&mut self, scope: UndoScope, author_id: Uuid) -> Option<Stroke> {
        let id = match scope {
            UndoScope::Global => self.strokes.keys().next_back().copied(),
            UndoScope::PerAuthor => self
                .strokes
                .values()
                .rev()
                .find(|s| s.author_id == author_id)
                .map(|s| s.id),
        }?;

        let removed = self.strokes.remove(&id);
        if removed.is_some() {
            self.stats.removed += 1;
        }
        removed
    }

    /// Full ordered dump of the log (ascending id).
    pub fn snapshot(&self) -> Vec<Stroke> {
        self.strokes.values().cloned().collect()
    }

    /// Look up a single stroke.
    pub fn get(&self, id: u64) -> Option<&Stroke> {
        self.strokes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    /// Id the next successful commit will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
