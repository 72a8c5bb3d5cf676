//! Recording sessions.
//!
//! A session is one continuous recording interval. It owns the frame index
//! used for timeline navigation; the frames themselves live in the
//! [`TieredFrameStore`](crate::store::TieredFrameStore).

pub mod manager;

use crate::frame::{FrameEvent, FrameKey, FrameRecord};
use crate::index::{AppendOutcome, FrameIndex, TimelineCursor};
use crate::store::{PersistedSession, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use manager::{DiscardReason, IngestOutcome, SessionManager};

/// Session manager errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active session")]
    NoActiveSession,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} has not ended")]
    SessionNotEnded(String),

    #[error("Session {0} is still recording")]
    RecordingInProgress(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a session stopped accepting frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Stopped by the user
    UserStop,
    /// The upstream source signalled end of stream
    EndOfStream,
    /// The upstream pipeline failed
    Error,
}

/// UI-facing state of the manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Idle,
    Recording,
    Paused,
    /// Browsing an ended session
    Review,
}

/// Read-only view of a session, as exported and persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub source_descriptor: String,
    pub total_recorded: u64,
    pub total_dropped: u64,
    pub total_skipped: u64,
    pub frame_count: usize,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

/// Frame ids of an ended session captured at export time
#[derive(Debug, Clone)]
pub struct ExportSnapshot {
    pub summary: SessionSummary,
    pub frame_ids: Vec<u64>,
}

impl ExportSnapshot {
    pub fn keys(&self) -> Vec<FrameKey> {
        self.frame_ids
            .iter()
            .map(|id| FrameKey::new(self.summary.session_id.clone(), *id))
            .collect()
    }
}

/// One recording run. The index lists every frame the store accepted,
/// including frames later lost to a failed spill; reading those yields
/// nothing and the loss shows up in `total_dropped`.
#[derive(Debug)]
pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    source_descriptor: String,
    end_reason: Option<EndReason>,
    total_recorded: u64,
    total_skipped: u64,
    index: FrameIndex,
    cursor: TimelineCursor,
}

impl Session {
    pub fn new(source_descriptor: impl Into<String>) -> Self {
        Self {
            // time-ordered: creation time in the high bits, random tail
            id: Uuid::now_v7().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            source_descriptor: source_descriptor.into(),
            end_reason: None,
            total_recorded: 0,
            total_skipped: 0,
            index: FrameIndex::new(),
            cursor: TimelineCursor::default(),
        }
    }

    /// Rebuild an ended session from its persisted record and the frames
    /// found in the cold tier.
    pub(crate) fn restored(persisted: &PersistedSession, records: &[FrameRecord]) -> Self {
        let mut index = FrameIndex::new();
        for record in records {
            index.append(record.frame_id, record.timestamp_ms, &record.emotion_results);
        }

        Self {
            id: persisted.session_id.clone(),
            started_at: persisted.started_at,
            ended_at: Some(persisted.ended_at.unwrap_or_else(Utc::now)),
            source_descriptor: persisted.source_descriptor.clone(),
            end_reason: None,
            total_recorded: persisted.total_recorded,
            total_skipped: 0,
            index,
            cursor: TimelineCursor::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn selected_frame(&self) -> Option<u64> {
        self.cursor.current(&self.index)
    }

    pub(crate) fn finish(&mut self, reason: EndReason) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
            self.end_reason = Some(reason);
        }
    }

    pub(crate) fn record_retained(&mut self, event: &FrameEvent) -> AppendOutcome {
        let outcome = self
            .index
            .append(event.frame_id, event.timestamp_ms, &event.emotions);
        if matches!(outcome, AppendOutcome::Appended(_)) {
            self.total_recorded += 1;
        }
        outcome
    }

    pub(crate) fn record_skipped(&mut self) {
        self.total_skipped += 1;
    }

    pub(crate) fn cursor_mut(&mut self) -> (&FrameIndex, &mut TimelineCursor) {
        (&self.index, &mut self.cursor)
    }

    pub fn summary(&self, total_dropped: u64) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            source_descriptor: self.source_descriptor.clone(),
            total_recorded: self.total_recorded,
            total_dropped,
            total_skipped: self.total_skipped,
            frame_count: self.index.len(),
            duration_ms: self.index.duration_ms(),
            end_reason: self.end_reason,
        }
    }

    pub(crate) fn to_persisted(&self, total_dropped: u64, cold_frame_ids: Vec<u64>) -> PersistedSession {
        PersistedSession {
            session_id: self.id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            source_descriptor: self.source_descriptor.clone(),
            total_recorded: self.total_recorded,
            total_dropped,
            cold_frame_ids,
        }
    }
}
