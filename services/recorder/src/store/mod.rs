//! Two-tier frame store.
//!
//! Retained frames land in a bounded in-memory hot tier. When the hot tier
//! exceeds its frame or byte budget the oldest frames are evicted onto a
//! single-consumer spill queue that writes them to the [`ColdStore`].
//!
//! An evicted frame stays readable from memory ("in flight") until the spill
//! worker has confirmed the cold write, so a frame is always observable in
//! exactly one tier.

pub mod cold;
mod spill;

use crate::frame::{FrameKey, FrameRecord, StoredFrame, Tier};
use crate::policy::RecordingPolicy;
use bytes::Bytes;
use cold::ColdStore;
use parking_lot::Mutex;
use spill::{SpillJob, SpillWorker};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

pub use cold::{MemoryColdStore, PersistedSession, SqliteColdStore};

/// Largest single frame accepted, as a fraction of `max_bytes`
pub const MAX_FRAME_FRACTION: f64 = 0.1;

/// Tiered store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Frame {key} rejected: {size} bytes exceeds single-frame limit of {limit} bytes")]
    WriteRejected { key: String, size: usize, limit: usize },

    #[error("Cold store write failed for {key}: {message}")]
    ColdStoreWrite { key: String, message: String },

    #[error("Cold store read failed: {0}")]
    ColdStoreRead(String),

    #[error("Spill queue closed")]
    QueueClosed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Store sizing
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_hot_frames: usize,
    pub max_bytes: usize,
    /// Fall through to the cold tier for frames not known to be spilled
    pub persist_cold_store: bool,
    pub spill_queue_capacity: usize,
    pub cold_read_batch_size: usize,
}

impl StoreSettings {
    pub fn from_policy(policy: &RecordingPolicy) -> Self {
        Self {
            max_hot_frames: policy.limits.max_hot_frames,
            max_bytes: policy.limits.max_bytes,
            persist_cold_store: policy.persist_cold_store,
            ..Self::default()
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        (self.max_bytes as f64 * MAX_FRAME_FRACTION) as usize
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        let policy = RecordingPolicy::default();
        Self {
            max_hot_frames: policy.limits.max_hot_frames,
            max_bytes: policy.limits.max_bytes,
            persist_cold_store: policy.persist_cold_store,
            spill_queue_capacity: 64,
            cold_read_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HotEntry {
    pub(crate) record: FrameRecord,
    pub(crate) image: Bytes,
}

impl HotEntry {
    fn to_stored(&self) -> StoredFrame {
        StoredFrame {
            record: self.record.clone(),
            image: self.image.clone(),
        }
    }
}

/// Open the cold tier selected by `persist`: SQLite at `database_url`, or
/// process memory.
pub async fn open_cold_store(
    persist: bool,
    database_url: &str,
    max_connections: u32,
) -> Result<Arc<dyn ColdStore>, StoreError> {
    if persist {
        let store = SqliteColdStore::connect(database_url, max_connections).await?;
        return Ok(Arc::new(store));
    }

    warn!("Cold store persistence disabled, spilled frames kept in process memory without a bound");
    Ok(Arc::new(MemoryColdStore::new()))
}

/// Per-session tier bookkeeping
#[derive(Debug, Default)]
pub(crate) struct SessionTierStats {
    pub(crate) dropped: u64,
    pub(crate) cold_frame_ids: BTreeSet<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct HotState {
    /// Arrival order of hot entries
    order: VecDeque<FrameKey>,
    entries: HashMap<FrameKey, HotEntry>,
    bytes: usize,
    /// Evicted, waiting for the cold write to be confirmed
    pub(crate) in_flight: HashMap<FrameKey, HotEntry>,
    sessions: HashMap<String, SessionTierStats>,
    pub(crate) spilled_total: u64,
    pub(crate) spill_failures: u64,
    rejected_total: u64,
}

impl HotState {
    pub(crate) fn session_mut(&mut self, session_id: &str) -> &mut SessionTierStats {
        self.sessions.entry(session_id.to_string()).or_default()
    }

    fn memory_frame(&self, key: &FrameKey) -> Option<StoredFrame> {
        self.entries
            .get(key)
            .or_else(|| self.in_flight.get(key))
            .map(HotEntry::to_stored)
    }

    fn is_cold_resident(&self, key: &FrameKey) -> bool {
        self.sessions
            .get(&key.session_id)
            .is_some_and(|s| s.cold_frame_ids.contains(&key.frame_id))
    }

    fn remove_hot(&mut self, key: &FrameKey) {
        if let Some(old) = self.entries.remove(key) {
            self.bytes -= old.image.len();
            self.order.retain(|k| k != key);
        }
        self.in_flight.remove(key);
        if let Some(session) = self.sessions.get_mut(&key.session_id) {
            session.cold_frame_ids.remove(&key.frame_id);
        }
    }
}

/// Point-in-time store counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hot_frames: usize,
    pub hot_bytes: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
    pub spilled_total: u64,
    pub spill_failures: u64,
    pub rejected_total: u64,
}

enum Lookup {
    Memory(StoredFrame),
    Cold,
    Miss,
}

/// Bounded hot tier in front of a cold store
pub struct TieredFrameStore {
    settings: StoreSettings,
    state: Arc<Mutex<HotState>>,
    cold: Arc<dyn ColdStore>,
    spill_tx: mpsc::Sender<SpillJob>,
    /// Serializes writers so eviction order equals spill order
    write_gate: tokio::sync::Mutex<()>,
}

impl TieredFrameStore {
    /// Create the store and start its spill worker. Must be called within a
    /// tokio runtime.
    pub fn new(settings: StoreSettings, cold: Arc<dyn ColdStore>) -> Self {
        let state = Arc::new(Mutex::new(HotState::default()));
        let (spill_tx, spill_rx) = mpsc::channel(settings.spill_queue_capacity.max(1));

        SpillWorker::spawn(state.clone(), cold.clone(), spill_rx);

        info!(
            max_hot_frames = settings.max_hot_frames,
            max_bytes = settings.max_bytes,
            persist_cold_store = settings.persist_cold_store,
            "Tiered frame store initialized"
        );

        Self {
            settings,
            state,
            cold,
            spill_tx,
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn cold_store(&self) -> &Arc<dyn ColdStore> {
        &self.cold
    }

    /// Insert a frame into the hot tier, spilling the oldest frames if the
    /// tier is over budget.
    ///
    /// Frames larger than [`MAX_FRAME_FRACTION`] of `max_bytes` are rejected
    /// and counted as dropped for their session.
    #[instrument(skip(self, record, image), fields(session_id = %record.session_id, frame_id = record.frame_id))]
    pub async fn write(&self, record: FrameRecord, image: Bytes) -> Result<(), StoreError> {
        let key = record.key();
        let size = image.len();
        let limit = self.settings.max_frame_bytes();

        if size > limit {
            {
                let mut state = self.state.lock();
                state.session_mut(&key.session_id).dropped += 1;
                state.rejected_total += 1;
            }
            metrics::counter!("recorder.frames.rejected").increment(1);
            warn!(size, limit, "Frame exceeds single-frame limit, dropped");
            return Err(StoreError::WriteRejected {
                key: key.to_string(),
                size,
                limit,
            });
        }

        let _gate = self.write_gate.lock().await;

        let evicted = {
            let mut state = self.state.lock();
            state.remove_hot(&key);

            let mut evicted = Vec::new();
            while state.order.len() >= self.settings.max_hot_frames
                || state.bytes + size > self.settings.max_bytes
            {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                if let Some(entry) = state.entries.remove(&oldest) {
                    state.bytes -= entry.image.len();
                    state.in_flight.insert(oldest.clone(), entry);
                    evicted.push(oldest);
                }
            }

            state.bytes += size;
            state.order.push_back(key.clone());
            state.entries.insert(key, HotEntry { record, image });

            metrics::gauge!("recorder.store.hot_frames").set(state.order.len() as f64);
            metrics::gauge!("recorder.store.hot_bytes").set(state.bytes as f64);
            evicted
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicting frames to cold tier");
        }

        // sent while still holding the gate: the queue sees evictions in order
        for key in evicted {
            self.spill_tx
                .send(SpillJob::Spill(key))
                .await
                .map_err(|_| StoreError::QueueClosed)?;
        }

        Ok(())
    }

    fn lookup(&self, key: &FrameKey) -> Lookup {
        let state = self.state.lock();
        if let Some(frame) = state.memory_frame(key) {
            Lookup::Memory(frame)
        } else if self.settings.persist_cold_store || state.is_cold_resident(key) {
            Lookup::Cold
        } else {
            Lookup::Miss
        }
    }

    /// Read a frame from the hot tier only
    pub fn read_hot(&self, key: &FrameKey) -> Option<StoredFrame> {
        self.state.lock().memory_frame(key)
    }

    /// Read a frame from whichever tier holds it
    pub async fn read(&self, key: &FrameKey) -> Result<Option<StoredFrame>, StoreError> {
        match self.lookup(key) {
            Lookup::Memory(frame) => Ok(Some(frame)),
            Lookup::Cold => self.cold.get_frame(key).await,
            Lookup::Miss => Ok(None),
        }
    }

    /// Read many frames, preserving the order of `keys`.
    ///
    /// Memory hits are served first; the remaining frames are fetched from
    /// the cold tier in batches of `cold_read_batch_size`. `on_progress`
    /// receives the completed fraction after each step. Frames that cannot
    /// be read come back as `None`.
    #[instrument(skip(self, keys, on_progress), fields(count = keys.len()))]
    pub async fn batch_read<F>(&self, keys: &[FrameKey], mut on_progress: F) -> Vec<Option<StoredFrame>>
    where
        F: FnMut(f32),
    {
        let total = keys.len();
        let mut results: Vec<Option<StoredFrame>> = vec![None; total];
        let mut cold_candidates: Vec<(usize, &FrameKey)> = Vec::new();

        {
            let state = self.state.lock();
            for (position, key) in keys.iter().enumerate() {
                if let Some(frame) = state.memory_frame(key) {
                    results[position] = Some(frame);
                } else if self.settings.persist_cold_store || state.is_cold_resident(key) {
                    cold_candidates.push((position, key));
                }
            }
        }

        if total == 0 {
            on_progress(1.0);
            return results;
        }

        let mut completed = total - cold_candidates.len();
        on_progress(completed as f32 / total as f32);

        for chunk in cold_candidates.chunks(self.settings.cold_read_batch_size.max(1)) {
            let mut by_session: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
            let mut positions: HashMap<&FrameKey, Vec<usize>> = HashMap::new();
            for (position, key) in chunk {
                by_session
                    .entry(key.session_id.as_str())
                    .or_default()
                    .push(key.frame_id);
                positions.entry(*key).or_default().push(*position);
            }

            for (session_id, frame_ids) in by_session {
                match self.cold.get_frames(session_id, &frame_ids).await {
                    Ok(frames) => {
                        for frame in frames {
                            let key = frame.record.key();
                            if let Some(slots) = positions.get(&key) {
                                for slot in slots {
                                    results[*slot] = Some(frame.clone());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "Cold batch read failed");
                    }
                }
            }

            completed += chunk.len();
            on_progress(completed as f32 / total as f32);
        }

        results
    }

    /// Wait until every spill queued before this call has completed
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.spill_tx
            .send(SpillJob::Flush(tx))
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        rx.await.map_err(|_| StoreError::QueueClosed)
    }

    /// Delete every frame from both tiers. Returns the number of cold frames
    /// removed.
    #[instrument(skip(self))]
    pub async fn purge(&self) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;

        {
            let mut state = self.state.lock();
            state.order.clear();
            state.entries.clear();
            state.in_flight.clear();
            state.sessions.clear();
            state.bytes = 0;
        }

        let (tx, rx) = oneshot::channel();
        self.spill_tx
            .send(SpillJob::Purge(tx))
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        let deleted = rx.await.map_err(|_| StoreError::QueueClosed)??;

        metrics::gauge!("recorder.store.hot_frames").set(0.0);
        metrics::gauge!("recorder.store.hot_bytes").set(0.0);
        Ok(deleted)
    }

    /// Take back a frame that was written but will never be indexed, counting
    /// it as dropped for its session. Returns whether the frame was resident.
    pub fn discard(&self, key: &FrameKey) -> bool {
        let mut state = self.state.lock();
        let resident = state.entries.contains_key(key) || state.in_flight.contains_key(key);
        if resident {
            state.remove_hot(key);
            state.session_mut(&key.session_id).dropped += 1;
            metrics::gauge!("recorder.store.hot_frames").set(state.order.len() as f64);
            metrics::gauge!("recorder.store.hot_bytes").set(state.bytes as f64);
        }
        resident
    }

    /// Tier a frame is currently observable in
    pub fn residency(&self, key: &FrameKey) -> Option<Tier> {
        let state = self.state.lock();
        if state.entries.contains_key(key) || state.in_flight.contains_key(key) {
            Some(Tier::Memory)
        } else if state.is_cold_resident(key) {
            Some(Tier::Persistent)
        } else {
            None
        }
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            hot_frames: state.order.len(),
            hot_bytes: state.bytes,
            in_flight: state.in_flight.len(),
            queue_depth: self.spill_tx.max_capacity() - self.spill_tx.capacity(),
            spilled_total: state.spilled_total,
            spill_failures: state.spill_failures,
            rejected_total: state.rejected_total,
        }
    }

    /// Frames of a session lost to rejection or spill failure
    pub fn dropped_frames(&self, session_id: &str) -> u64 {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.dropped)
    }

    pub fn cold_frame_ids(&self, session_id: &str) -> Vec<u64> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.cold_frame_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Hot-tier keys, oldest first
    pub fn hot_keys(&self) -> Vec<FrameKey> {
        self.state.lock().order.iter().cloned().collect()
    }

    /// Mark frames already present in the cold tier (e.g. from an earlier run)
    pub fn register_cold_frames(&self, session_id: &str, frame_ids: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock();
        state
            .session_mut(session_id)
            .cold_frame_ids
            .extend(frame_ids);
    }

    /// Seed the dropped counter of a restored session
    pub fn register_dropped(&self, session_id: &str, dropped: u64) {
        self.state.lock().session_mut(session_id).dropped = dropped;
    }
}
