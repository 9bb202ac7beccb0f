//! Stroke data model shared by the server log and client mirrors.
//!
//! A [`Stroke`] is one committed polyline with style attributes. Before it
//! reaches the server it travels as a [`StrokePayload`]; the store turns the
//! payload into a stroke by assigning the id, author and commit timestamp.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback color for payloads that do not carry one.
pub const DEFAULT_COLOR: &str = "#000000";

/// Width used when a payload omits it (or sends a non-finite value).
pub const DEFAULT_STROKE_WIDTH: f32 = 4.0;

/// 2D position in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Both components are finite (no NaN, no infinity).
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Which stroke an undo request removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UndoScope {
    /// The most recent stroke on the canvas, whoever drew it.
    #[default]
    Global,
    /// The most recent stroke drawn by the requesting author.
    PerAuthor,
}

impl UndoScope {
    /// Parse the configuration spelling (`global` / `per-author`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Some(Self::Global),
            "per-author" | "per_author" | "author" => Some(Self::PerAuthor),
            _ => None,
        }
    }
}

impl std::fmt::Display for UndoScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::PerAuthor => write!(f, "per-author"),
        }
    }
}

/// A stroke as submitted by a client, before the store commits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokePayload {
    pub points: Vec<Vec2>,
    pub color: Option<String>,
    pub stroke_width: Option<f32>,
    pub is_eraser: bool,
}

impl StrokePayload {
    pub fn new(points: Vec<Vec2>, color: impl Into<String>, stroke_width: f32) -> Self {
        Self {
            points,
            color: Some(color.into()),
            stroke_width: Some(stroke_width),
            is_eraser: false,
        }
    }

    /// Builder-style eraser flag.
    pub fn eraser(mut self, is_eraser: bool) -> Self {
        self.is_eraser = is_eraser;
        self
    }
}

/// A committed drawing action.
///
/// `points` never change after commit. `created_at` is informational; the
/// `id` alone defines the order of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: u64,
    pub author_id: Uuid,
    pub points: Vec<Vec2>,
    pub stroke_width: f32,
    pub color: String,
    pub is_eraser: bool,
    /// Unix milliseconds at commit time.
    pub created_at: u64,
}
