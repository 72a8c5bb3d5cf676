//! Per-session frame index used for timeline navigation and statistics.

use crate::frame::{dominant_by_votes, EmotionResult};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Result of appending a frame to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Appended at the given position
    Appended(usize),
    /// The frame id is already indexed; nothing changed
    Duplicate,
    /// The frame id is lower than the last indexed one; nothing changed
    OutOfOrder,
}

/// Ordered, append-only sequence of retained frames.
///
/// `frame_ids` is strictly increasing and `timestamps` non-decreasing in
/// append order.
#[derive(Debug, Clone, Default)]
pub struct FrameIndex {
    frame_ids: Vec<u64>,
    timestamps: Vec<f64>,
    known: HashSet<u64>,
    /// Vote-mode dominant emotion per frame (timeline coloring)
    dominant: Vec<Option<String>>,
    /// Per-target dominant labels per frame (aggregate statistics)
    target_labels: Vec<Vec<String>>,
}

impl FrameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Idempotent for already indexed frame ids.
    pub fn append(
        &mut self,
        frame_id: u64,
        timestamp_ms: f64,
        emotions: &[EmotionResult],
    ) -> AppendOutcome {
        if self.known.contains(&frame_id) {
            return AppendOutcome::Duplicate;
        }
        if self.frame_ids.last().is_some_and(|last| frame_id < *last) {
            return AppendOutcome::OutOfOrder;
        }

        let timestamp_ms = match self.timestamps.last() {
            Some(last) if timestamp_ms < *last => {
                warn!(
                    frame_id,
                    timestamp_ms,
                    last_timestamp_ms = *last,
                    "Timestamp went backwards, clamping"
                );
                *last
            }
            _ => timestamp_ms,
        };

        self.frame_ids.push(frame_id);
        self.timestamps.push(timestamp_ms);
        self.known.insert(frame_id);
        self.dominant.push(dominant_by_votes(emotions));
        self.target_labels.push(
            emotions
                .iter()
                .map(|e| e.dominant_emotion.clone())
                .collect(),
        );

        AppendOutcome::Appended(self.frame_ids.len() - 1)
    }

    /// Whether `frame_id` would be accepted by [`FrameIndex::append`]
    pub fn accepts(&self, frame_id: u64) -> bool {
        !self.known.contains(&frame_id) && self.frame_ids.last().map_or(true, |last| frame_id > *last)
    }

    pub fn contains(&self, frame_id: u64) -> bool {
        self.known.contains(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.frame_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_ids.is_empty()
    }

    pub fn frame_ids(&self) -> &[u64] {
        &self.frame_ids
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn frame_id_at(&self, position: usize) -> Option<u64> {
        self.frame_ids.get(position).copied()
    }

    pub fn position_of(&self, frame_id: u64) -> Option<usize> {
        self.frame_ids.binary_search(&frame_id).ok()
    }

    pub fn last_frame_id(&self) -> Option<u64> {
        self.frame_ids.last().copied()
    }

    /// Timeline color of the frame at `position`
    pub fn dominant_emotion_at(&self, position: usize) -> Option<&str> {
        self.dominant.get(position).and_then(|d| d.as_deref())
    }

    /// `(frame_id, dominant emotion)` for every indexed frame
    pub fn dominant_timeline(&self) -> Vec<(u64, Option<&str>)> {
        self.frame_ids
            .iter()
            .zip(&self.dominant)
            .map(|(id, dominant)| (*id, dominant.as_deref()))
            .collect()
    }

    /// Occurrences of each per-target dominant label across the session
    pub fn emotion_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for label in self.target_labels.iter().flatten() {
            *counts.entry(label.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Span between the first and last indexed timestamps
    pub fn duration_ms(&self) -> f64 {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

/// Selected position on a session's timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineCursor {
    position: Option<usize>,
}

impl TimelineCursor {
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Currently selected frame id
    pub fn current(&self, index: &FrameIndex) -> Option<u64> {
        self.position.and_then(|p| index.frame_id_at(p))
    }

    /// Jump to `ratio` of the timeline: `round(ratio * (n - 1))`
    pub fn scrub(&mut self, index: &FrameIndex, ratio: f64) -> Option<u64> {
        if index.is_empty() {
            self.position = None;
            return None;
        }

        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        let position = (ratio * (index.len() - 1) as f64).round() as usize;
        self.position = Some(position);
        index.frame_id_at(position)
    }

    /// Step forward, stopping at the last frame
    pub fn next(&mut self, index: &FrameIndex) -> Option<u64> {
        if index.is_empty() {
            return None;
        }
        let position = match self.position {
            Some(p) => (p + 1).min(index.len() - 1),
            None => 0,
        };
        self.position = Some(position);
        index.frame_id_at(position)
    }

    /// Step backward, stopping at the first frame
    pub fn prev(&mut self, index: &FrameIndex) -> Option<u64> {
        if index.is_empty() {
            return None;
        }
        let position = self.position.map_or(0, |p| p.saturating_sub(1).min(index.len() - 1));
        self.position = Some(position);
        index.frame_id_at(position)
    }

    /// Select the last indexed frame
    pub fn select_last(&mut self, index: &FrameIndex) -> Option<u64> {
        self.position = index.len().checked_sub(1);
        self.current(index)
    }

    pub fn clear(&mut self) {
        self.position = None;
    }
}
