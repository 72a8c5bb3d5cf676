use super::{EndReason, ExportSnapshot, Session, SessionError, SessionMode, SessionSummary};
use crate::frame::{FrameEvent, FrameKey, FrameRecord, StoredFrame, StreamEvent, StreamEventName, StreamEventReason};
use crate::index::AppendOutcome;
use crate::policy::{PolicyEvaluator, RecordingPolicy, RetentionDecision};
use crate::store::{StoreError, TieredFrameStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Why an event was not considered for retention at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NoActiveSession,
    /// Tagged with a session other than the active one
    SessionMismatch,
    Paused,
    Duplicate,
    OutOfOrder,
}

/// Result of ingesting one frame event
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Retained { frame_id: u64, reason: String },
    /// Policy decided not to keep the frame
    Skipped { reason: String },
    /// Retained by policy but refused by the store; counted as dropped
    Dropped,
    /// Not attributable to the active session; not counted
    Discarded(DiscardReason),
}

struct ManagerState {
    /// In start order
    sessions: Vec<Session>,
    active: Option<String>,
    /// Ended session being reviewed
    selected: Option<String>,
    paused: bool,
    evaluator: PolicyEvaluator,
}

impl ManagerState {
    fn find(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id() == session_id)
    }

    fn find_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id() == session_id)
    }

    /// Session the timeline operates on: the reviewed one, else the active one
    fn focused_mut(&mut self) -> Option<&mut Session> {
        let id = self.selected.clone().or_else(|| self.active.clone())?;
        self.find_mut(&id)
    }
}

/// Owns the session registry and routes frame events into the store.
///
/// Constructed once and shared (`Arc<SessionManager>`) with every consumer.
pub struct SessionManager {
    store: Arc<TieredFrameStore>,
    state: Mutex<ManagerState>,
    /// Ingestion is single-writer
    ingest_gate: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<TieredFrameStore>, policy: RecordingPolicy) -> Self {
        Self {
            store,
            state: Mutex::new(ManagerState {
                sessions: Vec::new(),
                active: None,
                selected: None,
                paused: false,
                evaluator: PolicyEvaluator::new(policy),
            }),
            ingest_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<TieredFrameStore> {
        &self.store
    }

    /// Start recording a new session and return its id
    pub fn start(&self, source_descriptor: &str) -> Result<String, SessionError> {
        let mut state = self.state.lock();
        if let Some(active) = &state.active {
            return Err(SessionError::RecordingInProgress(active.clone()));
        }

        let session = Session::new(source_descriptor);
        let id = session.id().to_string();

        state.sessions.push(session);
        state.active = Some(id.clone());
        state.selected = None;
        state.paused = false;
        state.evaluator.reset();

        metrics::counter!("recorder.sessions.started").increment(1);
        info!(session_id = %id, source = %source_descriptor, "Session started");
        Ok(id)
    }

    /// Stop accepting frames without ending the session
    pub fn pause(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.active.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        state.paused = true;
        debug!("Recording paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.active.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        state.paused = false;
        debug!("Recording resumed");
        Ok(())
    }

    /// User stop: freeze the active session and switch to reviewing it
    pub fn end(&self) -> Result<SessionSummary, SessionError> {
        self.finish_active(EndReason::UserStop)
    }

    /// Upstream end of stream: like [`end`](Self::end), and selects the last
    /// frame of the session
    pub fn mark_ended(&self) -> Result<SessionSummary, SessionError> {
        let summary = self.finish_active(EndReason::EndOfStream)?;

        let mut state = self.state.lock();
        if let Some(session) = state.find_mut(&summary.session_id) {
            let (index, cursor) = session.cursor_mut();
            cursor.select_last(index);
        }
        Ok(summary)
    }

    fn finish_active(&self, reason: EndReason) -> Result<SessionSummary, SessionError> {
        let mut state = self.state.lock();
        let id = state.active.take().ok_or(SessionError::NoActiveSession)?;
        state.paused = false;
        state.selected = Some(id.clone());

        let session = state
            .find_mut(&id)
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;
        session.finish(reason);
        let summary = session.summary(self.store.dropped_frames(&id));

        metrics::counter!("recorder.sessions.ended").increment(1);
        info!(
            session_id = %id,
            reason = ?reason,
            recorded = summary.total_recorded,
            dropped = summary.total_dropped,
            "Session ended"
        );
        Ok(summary)
    }

    /// Review an ended session. Never resumes recording.
    pub fn switch_to_session(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        let mut state = self.state.lock();
        if let Some(active) = &state.active {
            return Err(SessionError::RecordingInProgress(active.clone()));
        }

        let session = state
            .find(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        if !session.is_ended() {
            return Err(SessionError::SessionNotEnded(session_id.to_string()));
        }
        let summary = session.summary(self.store.dropped_frames(session_id));

        state.selected = Some(session_id.to_string());
        debug!(session_id, "Switched to session");
        Ok(summary)
    }

    /// Remove every session and all stored frames. Used when the upstream
    /// source changes.
    #[instrument(skip(self))]
    pub async fn clear_all_sessions(&self) -> Result<u64, SessionError> {
        let _gate = self.ingest_gate.lock().await;

        let removed = {
            let mut state = self.state.lock();
            let removed = state.sessions.len();
            state.sessions.clear();
            state.active = None;
            state.selected = None;
            state.paused = false;
            state.evaluator.reset();
            removed
        };

        let deleted = self.store.purge().await?;
        info!(sessions = removed, cold_frames = deleted, "All sessions cleared");
        Ok(deleted)
    }

    /// Route a frame event to the active session
    #[instrument(skip(self, event), fields(session_id = %event.session_id, frame_id = event.frame_id))]
    pub async fn ingest(&self, event: FrameEvent) -> Result<IngestOutcome, SessionError> {
        let _gate = self.ingest_gate.lock().await;

        let reason = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(active_id) = state.active.as_deref() else {
                return Ok(IngestOutcome::Discarded(DiscardReason::NoActiveSession));
            };
            if event.session_id != active_id {
                trace!(active = %active_id, "Event from another session discarded");
                return Ok(IngestOutcome::Discarded(DiscardReason::SessionMismatch));
            }
            if state.paused {
                return Ok(IngestOutcome::Discarded(DiscardReason::Paused));
            }

            let Some(session) = state.sessions.iter_mut().find(|s| s.id() == event.session_id) else {
                return Ok(IngestOutcome::Discarded(DiscardReason::NoActiveSession));
            };
            if session.index().contains(event.frame_id) {
                return Ok(IngestOutcome::Discarded(DiscardReason::Duplicate));
            }
            if !session.index().accepts(event.frame_id) {
                debug!("Out-of-order frame discarded");
                return Ok(IngestOutcome::Discarded(DiscardReason::OutOfOrder));
            }

            match state.evaluator.evaluate(&event) {
                RetentionDecision::Retain { reason } => reason,
                RetentionDecision::Skip { reason } => {
                    session.record_skipped();
                    metrics::counter!("recorder.frames.skipped").increment(1);
                    return Ok(IngestOutcome::Skipped { reason });
                }
            }
        };

        let record = FrameRecord::from_event(&event);
        match self.store.write(record, event.image_bytes.clone()).await {
            Ok(()) => {}
            Err(StoreError::WriteRejected { .. }) => {
                metrics::counter!("recorder.frames.dropped").increment(1);
                return Ok(IngestOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.active.as_deref() != Some(event.session_id.as_str()) {
            // ended while the write waited on the spill queue
            self.store
                .discard(&FrameKey::new(event.session_id.clone(), event.frame_id));
            metrics::counter!("recorder.frames.dropped").increment(1);
            warn!("Session ended while frame was being stored, dropped");
            return Ok(IngestOutcome::Dropped);
        }

        state.evaluator.commit(&event);
        if let Some(session) = state.sessions.iter_mut().find(|s| s.id() == event.session_id) {
            if let AppendOutcome::Appended(position) = session.record_retained(&event) {
                trace!(position, "Frame indexed");
            }
        }

        metrics::counter!("recorder.frames.retained").increment(1);
        Ok(IngestOutcome::Retained {
            frame_id: event.frame_id,
            reason,
        })
    }

    /// Apply an upstream lifecycle event. Returns the summary of the session
    /// it ended, if any.
    pub fn handle_stream_event(&self, event: &StreamEvent) -> Result<Option<SessionSummary>, SessionError> {
        let active = self.active_session_id();
        if active.is_none() || (!event.session_id.is_empty() && active.as_deref() != Some(event.session_id.as_str())) {
            debug!(name = ?event.name, session_id = %event.session_id, "Stream event ignored");
            return Ok(None);
        }

        let summary = match (event.name, event.reason) {
            (StreamEventName::RecordingStarted, _) => return Ok(None),
            (_, Some(StreamEventReason::Error)) => self.finish_active(EndReason::Error)?,
            (_, Some(StreamEventReason::UserStop)) | (StreamEventName::RecordingStopped, _) => self.end()?,
            (StreamEventName::Eos, _) => self.mark_ended()?,
        };
        Ok(Some(summary))
    }

    /// Drain pending spills and persist every session summary
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.store.flush().await?;

        let persisted: Vec<_> = {
            let state = self.state.lock();
            state
                .sessions
                .iter()
                .map(|s| {
                    s.to_persisted(
                        self.store.dropped_frames(s.id()),
                        self.store.cold_frame_ids(s.id()),
                    )
                })
                .collect()
        };

        let cold = self.store.cold_store();
        for session in &persisted {
            cold.put_session(session).await?;
        }

        debug!(sessions = persisted.len(), "Sessions persisted");
        Ok(())
    }

    /// Load sessions from earlier runs out of the cold tier. Sessions already
    /// known are left untouched. Returns the number of sessions restored.
    #[instrument(skip(self))]
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let cold = self.store.cold_store().clone();
        let persisted = cold.list_sessions().await?;

        let mut restored = 0;
        for p in persisted {
            if self.state.lock().find(&p.session_id).is_some() {
                continue;
            }

            let records = cold.list_frame_records(&p.session_id).await?;
            if p.ended_at.is_none() {
                warn!(session_id = %p.session_id, "Session was not ended cleanly");
            }

            self.store
                .register_cold_frames(&p.session_id, records.iter().map(|r| r.frame_id));
            self.store.register_dropped(&p.session_id, p.total_dropped);

            let session = Session::restored(&p, &records);
            self.state.lock().sessions.push(session);
            restored += 1;
        }

        if restored > 0 {
            info!(restored, "Sessions restored from cold store");
        }
        Ok(restored)
    }

    pub fn mode(&self) -> SessionMode {
        let state = self.state.lock();
        match (&state.active, state.paused, &state.selected) {
            (Some(_), false, _) => SessionMode::Recording,
            (Some(_), true, _) => SessionMode::Paused,
            (None, _, Some(_)) => SessionMode::Review,
            (None, _, None) => SessionMode::Idle,
        }
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    pub fn selected_session_id(&self) -> Option<String> {
        self.state.lock().selected.clone()
    }

    pub fn summary(&self, session_id: &str) -> Option<SessionSummary> {
        let state = self.state.lock();
        state
            .find(session_id)
            .map(|s| s.summary(self.store.dropped_frames(session_id)))
    }

    /// All sessions in start order
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let state = self.state.lock();
        state
            .sessions
            .iter()
            .map(|s| s.summary(self.store.dropped_frames(s.id())))
            .collect()
    }

    /// Move the focused session's cursor to `ratio` of its timeline
    pub fn scrub(&self, ratio: f64) -> Option<u64> {
        let mut state = self.state.lock();
        let (index, cursor) = state.focused_mut()?.cursor_mut();
        cursor.scrub(index, ratio)
    }

    pub fn next_frame(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let (index, cursor) = state.focused_mut()?.cursor_mut();
        cursor.next(index)
    }

    pub fn prev_frame(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let (index, cursor) = state.focused_mut()?.cursor_mut();
        cursor.prev(index)
    }

    pub fn selected_frame(&self) -> Option<u64> {
        let mut state = self.state.lock();
        state.focused_mut()?.selected_frame()
    }

    /// Read the frame under the cursor of the focused session.
    ///
    /// `Ok(None)` also covers an indexed frame whose spill failed: the
    /// timeline keeps its position but the image is gone.
    pub async fn read_selected_frame(&self) -> Result<Option<StoredFrame>, SessionError> {
        let key = {
            let mut state = self.state.lock();
            state.focused_mut().and_then(|s| {
                let id = s.id().to_string();
                s.selected_frame().map(|frame_id| FrameKey::new(id, frame_id))
            })
        };

        let Some(key) = key else {
            return Ok(None);
        };
        let frame = self.store.read(&key).await?;
        if frame.is_none() {
            warn!(key = %key, "Selected frame is indexed but no longer stored");
        }
        Ok(frame)
    }

    /// `(frame_id, dominant emotion)` along a session's timeline
    pub fn dominant_timeline(&self, session_id: &str) -> Option<Vec<(u64, Option<String>)>> {
        let state = self.state.lock();
        state.find(session_id).map(|s| {
            s.index()
                .dominant_timeline()
                .into_iter()
                .map(|(id, label)| (id, label.map(str::to_string)))
                .collect()
        })
    }

    /// Occurrences of each per-target dominant label in a session
    pub fn emotion_statistics(&self, session_id: &str) -> Option<BTreeMap<String, usize>> {
        self.state
            .lock()
            .find(session_id)
            .map(|s| s.index().emotion_counts())
    }

    /// Frame ids of an ended session, for export
    pub fn export_snapshot(&self, session_id: &str) -> Result<ExportSnapshot, SessionError> {
        let state = self.state.lock();
        let session = state
            .find(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        if !session.is_ended() {
            return Err(SessionError::SessionNotEnded(session_id.to_string()));
        }

        Ok(ExportSnapshot {
            summary: session.summary(self.store.dropped_frames(session_id)),
            frame_ids: session.index().frame_ids().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EmotionResult;
    use crate::policy::RecordingMode;
    use crate::store::{MemoryColdStore, SqliteColdStore, StoreSettings};
    use crate::store::cold::ColdStore;
    use bytes::Bytes;

    fn create_test_event(session_id: &str, frame_id: u64) -> FrameEvent {
        FrameEvent {
            session_id: session_id.to_string(),
            frame_id,
            timestamp_ms: frame_id as f64 * 40.0,
            detections: vec![],
            emotions: vec![EmotionResult {
                detection_id: 0,
                probabilities: BTreeMap::new(),
                dominant_emotion: "neutral".to_string(),
                confidence: 0.7,
            }],
            image_bytes: Bytes::from(vec![7u8; 16]),
        }
    }

    fn all_frames_policy() -> RecordingPolicy {
        RecordingPolicy {
            mode: RecordingMode::All,
            ..RecordingPolicy::default()
        }
    }

    fn create_test_manager(
        max_hot_frames: usize,
        policy: RecordingPolicy,
        cold: Arc<dyn ColdStore>,
    ) -> SessionManager {
        let settings = StoreSettings {
            max_hot_frames,
            max_bytes: 10_000,
            persist_cold_store: false,
            spill_queue_capacity: 16,
            cold_read_batch_size: 8,
        };
        let store = Arc::new(TieredFrameStore::new(settings, cold));
        SessionManager::new(store, policy)
    }

    async fn record(manager: &SessionManager, session_id: &str, ids: std::ops::Range<u64>) {
        for id in ids {
            let outcome = manager.ingest(create_test_event(session_id, id)).await.unwrap();
            assert!(matches!(outcome, IngestOutcome::Retained { .. }), "{outcome:?}");
        }
    }

    #[tokio::test]
    async fn test_mismatched_session_is_discarded_not_counted() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();

        let outcome = manager.ingest(create_test_event("stale", 0)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Discarded(DiscardReason::SessionMismatch));

        let summary = manager.summary(&id).unwrap();
        assert_eq!(summary.total_recorded, 0);
        assert_eq!(summary.total_dropped, 0);
    }

    #[tokio::test]
    async fn test_frames_never_attributed_to_another_session() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));

        let a = manager.start("camera:0").unwrap();
        record(&manager, &a, 0..2).await;
        manager.end().unwrap();

        let b = manager.start("camera:0").unwrap();
        let outcome = manager.ingest(create_test_event(&a, 2)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Discarded(DiscardReason::SessionMismatch));

        assert_eq!(manager.summary(&a).unwrap().total_recorded, 2);
        assert_eq!(manager.summary(&b).unwrap().total_recorded, 0);
    }

    #[tokio::test]
    async fn test_sequential_sessions_survive_stop_until_cleared() {
        let cold = Arc::new(MemoryColdStore::new());
        let manager = create_test_manager(2, all_frames_policy(), cold.clone());

        let a = manager.start("camera:0").unwrap();
        record(&manager, &a, 0..4).await;
        manager.end().unwrap();

        let b = manager.start("camera:0").unwrap();
        assert!(matches!(
            manager.switch_to_session(&a),
            Err(SessionError::RecordingInProgress(_))
        ));
        record(&manager, &b, 0..4).await;
        manager.end().unwrap();
        manager.flush().await.unwrap();

        assert_eq!(manager.list_sessions().len(), 2);
        assert_eq!(cold.frame_count(), 6);

        let summary = manager.switch_to_session(&a).unwrap();
        assert_eq!(summary.frame_count, 4);
        assert_eq!(manager.mode(), SessionMode::Review);
        assert_eq!(manager.selected_session_id(), Some(a.clone()));

        // reviewing never resumes recording
        let outcome = manager.ingest(create_test_event(&a, 10)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Discarded(DiscardReason::NoActiveSession));

        let frame = manager.store().read(&FrameKey::new(a.clone(), 0)).await.unwrap();
        assert!(frame.is_some());

        manager.clear_all_sessions().await.unwrap();
        assert!(manager.list_sessions().is_empty());
        assert_eq!(cold.frame_count(), 0);
        assert_eq!(manager.mode(), SessionMode::Idle);
    }

    #[tokio::test]
    async fn test_switch_requires_ended_session() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        assert!(matches!(
            manager.switch_to_session("missing"),
            Err(SessionError::SessionNotFound(_))
        ));

        let id = manager.start("camera:0").unwrap();
        assert!(matches!(
            manager.export_snapshot(&id),
            Err(SessionError::SessionNotEnded(_))
        ));
        assert!(matches!(manager.start("camera:1"), Err(SessionError::RecordingInProgress(_))));
    }

    #[tokio::test]
    async fn test_end_of_stream_selects_last_frame() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("video:clip.mp4").unwrap();
        record(&manager, &id, 0..5).await;

        let eos = StreamEvent {
            session_id: id.clone(),
            name: StreamEventName::Eos,
            reason: Some(StreamEventReason::SourceEof),
            frame_id: Some(4),
        };
        let summary = manager.handle_stream_event(&eos).unwrap().unwrap();

        assert_eq!(summary.end_reason, Some(EndReason::EndOfStream));
        assert_eq!(manager.mode(), SessionMode::Review);
        assert_eq!(manager.selected_frame(), Some(4));
        assert_eq!(manager.prev_frame(), Some(3));
        assert_eq!(manager.scrub(0.0), Some(0));

        let frame = manager.read_selected_frame().await.unwrap().unwrap();
        assert_eq!(frame.record.frame_id, 0);
    }

    #[tokio::test]
    async fn test_error_event_ends_session() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();

        let event = StreamEvent {
            session_id: String::new(),
            name: StreamEventName::Eos,
            reason: Some(StreamEventReason::Error),
            frame_id: None,
        };
        manager.handle_stream_event(&event).unwrap();

        assert_eq!(manager.summary(&id).unwrap().end_reason, Some(EndReason::Error));
        assert_eq!(manager.active_session_id(), None);
    }

    #[tokio::test]
    async fn test_paused_events_are_discarded() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();

        manager.pause().unwrap();
        assert_eq!(manager.mode(), SessionMode::Paused);
        let outcome = manager.ingest(create_test_event(&id, 0)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Discarded(DiscardReason::Paused));

        manager.resume().unwrap();
        record(&manager, &id, 1..2).await;
        assert_eq!(manager.summary(&id).unwrap().total_recorded, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_order_frames_ignored() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();
        record(&manager, &id, 3..5).await;

        let duplicate = manager.ingest(create_test_event(&id, 4)).await.unwrap();
        assert_eq!(duplicate, IngestOutcome::Discarded(DiscardReason::Duplicate));
        let late = manager.ingest(create_test_event(&id, 1)).await.unwrap();
        assert_eq!(late, IngestOutcome::Discarded(DiscardReason::OutOfOrder));

        assert_eq!(manager.summary(&id).unwrap().frame_count, 2);
    }

    #[tokio::test]
    async fn test_rejected_frame_does_not_move_policy_state() {
        let manager = create_test_manager(10, RecordingPolicy::default(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();

        let mut oversized = create_test_event(&id, 0);
        oversized.image_bytes = Bytes::from(vec![0u8; 1_001]);
        assert_eq!(manager.ingest(oversized).await.unwrap(), IngestOutcome::Dropped);

        // still the first retained frame of the session as far as policy goes
        let outcome = manager.ingest(create_test_event(&id, 1)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Retained { .. }));

        let skipped = manager.ingest(create_test_event(&id, 2)).await.unwrap();
        assert!(matches!(skipped, IngestOutcome::Skipped { .. }));

        let summary = manager.summary(&id).unwrap();
        assert_eq!(summary.total_dropped, 1);
        assert_eq!(summary.total_recorded, 1);
        assert_eq!(summary.total_skipped, 1);
    }

    #[tokio::test]
    async fn test_emotion_statistics_and_snapshot() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();
        record(&manager, &id, 0..3).await;
        manager.end().unwrap();

        let stats = manager.emotion_statistics(&id).unwrap();
        assert_eq!(stats.get("neutral"), Some(&3));

        let timeline = manager.dominant_timeline(&id).unwrap();
        assert_eq!(timeline[2], (2, Some("neutral".to_string())));

        let snapshot = manager.export_snapshot(&id).unwrap();
        assert_eq!(snapshot.frame_ids, vec![0, 1, 2]);
        assert_eq!(snapshot.keys()[1], FrameKey::new(id.clone(), 1));
    }

    #[tokio::test]
    async fn test_frame_stored_after_session_end_is_dropped() {
        let cold = Arc::new(MemoryColdStore::new());
        cold.set_write_delay(Some(std::time::Duration::from_millis(300)));
        let settings = StoreSettings {
            max_hot_frames: 1,
            max_bytes: 10_000,
            persist_cold_store: false,
            spill_queue_capacity: 1,
            cold_read_batch_size: 8,
        };
        let store = Arc::new(TieredFrameStore::new(settings, cold));
        let manager = Arc::new(SessionManager::new(store.clone(), all_frames_policy()));

        let id = manager.start("camera:0").unwrap();
        record(&manager, &id, 0..3).await;

        // the spill queue is full, so this write parks behind the slow cold store
        let pending = {
            let manager = manager.clone();
            let event = create_test_event(&id, 3);
            tokio::spawn(async move { manager.ingest(event).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        manager.end().unwrap();

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped);

        let summary = manager.summary(&id).unwrap();
        assert_eq!(summary.frame_count, 3);
        assert_eq!(summary.total_dropped, 1);
        assert_eq!(store.residency(&FrameKey::new(id.clone(), 3)), None);
        assert_eq!(store.stats().hot_frames, 0);
    }

    #[tokio::test]
    async fn test_stream_event_for_other_session_is_ignored() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();

        let stale = StreamEvent {
            session_id: "other".to_string(),
            name: StreamEventName::Eos,
            reason: Some(StreamEventReason::SourceEof),
            frame_id: None,
        };
        assert_eq!(manager.handle_stream_event(&stale).unwrap(), None);
        assert_eq!(manager.active_session_id(), Some(id.clone()));
        assert_eq!(manager.mode(), SessionMode::Recording);
    }

    #[tokio::test]
    async fn test_recording_started_event_changes_nothing() {
        let manager = create_test_manager(10, all_frames_policy(), Arc::new(MemoryColdStore::new()));
        let id = manager.start("camera:0").unwrap();

        let started = StreamEvent {
            session_id: id.clone(),
            name: StreamEventName::RecordingStarted,
            reason: None,
            frame_id: None,
        };
        assert_eq!(manager.handle_stream_event(&started).unwrap(), None);
        assert_eq!(manager.active_session_id(), Some(id));
        assert_eq!(manager.mode(), SessionMode::Recording);
    }

    #[tokio::test]
    async fn test_frame_lost_to_failed_spill_reads_as_none() {
        let cold = Arc::new(MemoryColdStore::new());
        cold.set_fail_writes(true);
        let manager = create_test_manager(1, all_frames_policy(), cold);

        let id = manager.start("camera:0").unwrap();
        record(&manager, &id, 0..3).await;
        manager.end().unwrap();
        manager.flush().await.unwrap();

        assert_eq!(manager.scrub(0.0), Some(0));
        assert!(manager.read_selected_frame().await.unwrap().is_none());

        // the newest frame never left the hot tier
        assert_eq!(manager.next_frame(), Some(1));
        assert_eq!(manager.scrub(1.0), Some(2));
        assert!(manager.read_selected_frame().await.unwrap().is_some());

        let summary = manager.summary(&id).unwrap();
        assert_eq!(summary.frame_count, 3);
        assert_eq!(summary.total_dropped, 2);
    }

    #[tokio::test]
    async fn test_restore_sessions_from_durable_store() {
        let cold: Arc<dyn ColdStore> = Arc::new(SqliteColdStore::in_memory().await.unwrap());

        let id = {
            let manager = create_test_manager(2, all_frames_policy(), cold.clone());
            let id = manager.start("video:clip.mp4").unwrap();
            record(&manager, &id, 0..5).await;
            manager.end().unwrap();
            manager.flush().await.unwrap();
            id
        };

        let manager = create_test_manager(2, all_frames_policy(), cold.clone());
        assert_eq!(manager.restore_sessions().await.unwrap(), 1);
        assert_eq!(manager.restore_sessions().await.unwrap(), 0);

        // frames still hot at shutdown never reached the cold tier
        let summary = manager.summary(&id).unwrap();
        assert_eq!(summary.total_recorded, 5);
        assert_eq!(summary.frame_count, 3);
        assert!(summary.ended_at.is_some());

        manager.switch_to_session(&id).unwrap();
        let frame = manager.store().read(&FrameKey::new(id.clone(), 2)).await.unwrap();
        assert_eq!(frame.map(|f| f.record.frame_id), Some(2));
    }
}
