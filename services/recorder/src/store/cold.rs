//! Cold tier: durable key-value store for spilled frames and session records.

use super::StoreError;
use crate::frame::{FrameKey, FrameRecord, StoredFrame, Tier};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// SQLite bind parameter budget per bulk query
const MAX_BULK_PARAMS: usize = 500;

/// Session record as kept in the sessions table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub source_descriptor: String,
    pub total_recorded: u64,
    pub total_dropped: u64,
    pub cold_frame_ids: Vec<u64>,
}

/// Persistent key-value store behind the hot tier.
///
/// `put_frame` must store metadata and image as one atomic unit.
#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn put_frame(&self, record: &FrameRecord, image: &[u8]) -> Result<(), StoreError>;

    async fn get_frame(&self, key: &FrameKey) -> Result<Option<StoredFrame>, StoreError>;

    /// Bulk read of frames of one session; missing ids are simply absent
    async fn get_frames(
        &self,
        session_id: &str,
        frame_ids: &[u64],
    ) -> Result<Vec<StoredFrame>, StoreError>;

    /// Metadata of every stored frame of a session, ascending frame id
    async fn list_frame_records(&self, session_id: &str) -> Result<Vec<FrameRecord>, StoreError>;

    async fn put_session(&self, session: &PersistedSession) -> Result<(), StoreError>;

    async fn list_sessions(&self) -> Result<Vec<PersistedSession>, StoreError>;

    /// Delete every frame and session. Returns the number of frames removed.
    async fn purge(&self) -> Result<u64, StoreError>;
}

fn into_persistent(mut record: FrameRecord, image: Bytes) -> StoredFrame {
    record.image_ref.tier = Tier::Persistent;
    StoredFrame { record, image }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Debug, FromRow)]
struct FrameRow {
    record: String,
    data: Vec<u8>,
}

impl FrameRow {
    fn into_stored(self) -> Result<StoredFrame, StoreError> {
        let record: FrameRecord = serde_json::from_str(&self.record)?;
        Ok(into_persistent(record, Bytes::from(self.data)))
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: String,
    started_at_ms: i64,
    ended_at_ms: Option<i64>,
    source_descriptor: String,
    total_recorded: i64,
    total_dropped: i64,
    cold_frame_ids: String,
}

impl SessionRow {
    fn into_persisted(self) -> Result<PersistedSession, StoreError> {
        Ok(PersistedSession {
            session_id: self.session_id,
            started_at: millis_to_datetime(self.started_at_ms),
            ended_at: self.ended_at_ms.map(millis_to_datetime),
            source_descriptor: self.source_descriptor,
            total_recorded: self.total_recorded.max(0) as u64,
            total_dropped: self.total_dropped.max(0) as u64,
            cold_frame_ids: serde_json::from_str(&self.cold_frame_ids)?,
        })
    }
}

/// SQLite-backed cold store
pub struct SqliteColdStore {
    pool: SqlitePool,
}

impl SqliteColdStore {
    /// Open (creating if needed) the database at `url` and run migrations
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(url = %url, "Connected to cold store database");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database, lost when the store is dropped
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // a second connection would open a different empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Cold store migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ColdStore for SqliteColdStore {
    #[instrument(skip(self, record, image), fields(key = %record.image_ref.key))]
    async fn put_frame(&self, record: &FrameRecord, image: &[u8]) -> Result<(), StoreError> {
        let key = record.key().to_string();
        let record_json = serde_json::to_string(record)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO frame_meta (key, session_id, frame_id, timestamp_ms, record)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&key)
        .bind(&record.session_id)
        .bind(record.frame_id as i64)
        .bind(record.timestamp_ms)
        .bind(&record_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO frame_image (key, session_id, frame_id, mime, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&key)
        .bind(&record.session_id)
        .bind(record.frame_id as i64)
        .bind(&record.image_ref.mime)
        .bind(image)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn get_frame(&self, key: &FrameKey) -> Result<Option<StoredFrame>, StoreError> {
        let row = sqlx::query_as::<_, FrameRow>(
            r#"
            SELECT m.record AS record, i.data AS data
            FROM frame_meta m
            JOIN frame_image i ON i.key = m.key
            WHERE m.key = ?1
            "#,
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(FrameRow::into_stored).transpose()
    }

    #[instrument(skip(self, frame_ids), fields(count = frame_ids.len()))]
    async fn get_frames(
        &self,
        session_id: &str,
        frame_ids: &[u64],
    ) -> Result<Vec<StoredFrame>, StoreError> {
        let mut frames = Vec::with_capacity(frame_ids.len());

        for chunk in frame_ids.chunks(MAX_BULK_PARAMS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT m.record AS record, i.data AS data \
                 FROM frame_meta m JOIN frame_image i ON i.key = m.key \
                 WHERE m.session_id = ",
            );
            builder.push_bind(session_id);
            builder.push(" AND m.frame_id IN (");
            let mut separated = builder.separated(", ");
            for frame_id in chunk {
                separated.push_bind(*frame_id as i64);
            }
            separated.push_unseparated(") ORDER BY m.frame_id");

            let rows = builder
                .build_query_as::<FrameRow>()
                .fetch_all(&self.pool)
                .await?;

            for row in rows {
                frames.push(row.into_stored()?);
            }
        }

        Ok(frames)
    }

    async fn list_frame_records(&self, session_id: &str) -> Result<Vec<FrameRecord>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record FROM frame_meta WHERE session_id = ?1 ORDER BY frame_id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json,)| {
                let mut record: FrameRecord = serde_json::from_str(&json)?;
                record.image_ref.tier = Tier::Persistent;
                Ok(record)
            })
            .collect()
    }

    async fn put_session(&self, session: &PersistedSession) -> Result<(), StoreError> {
        let cold_frame_ids = serde_json::to_string(&session.cold_frame_ids)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, started_at_ms, ended_at_ms, source_descriptor,
                total_recorded, total_dropped, cold_frame_ids
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(session_id) DO UPDATE SET
                ended_at_ms = excluded.ended_at_ms,
                source_descriptor = excluded.source_descriptor,
                total_recorded = excluded.total_recorded,
                total_dropped = excluded.total_dropped,
                cold_frame_ids = excluded.cold_frame_ids
            "#,
        )
        .bind(&session.session_id)
        .bind(session.started_at.timestamp_millis())
        .bind(session.ended_at.map(|t| t.timestamp_millis()))
        .bind(&session.source_descriptor)
        .bind(session.total_recorded as i64)
        .bind(session.total_dropped as i64)
        .bind(&cold_frame_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<PersistedSession>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, started_at_ms, ended_at_ms, source_descriptor,
                   total_recorded, total_dropped, cold_frame_ids
            FROM sessions
            ORDER BY started_at_ms ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRow::into_persisted).collect()
    }

    #[instrument(skip(self))]
    async fn purge(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM frame_image").execute(&mut *tx).await?;
        let deleted = sqlx::query("DELETE FROM frame_meta")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;

        tx.commit().await?;

        info!(deleted_frames = deleted, "Cold store purged");
        Ok(deleted)
    }
}

#[derive(Default)]
struct MemoryColdState {
    frames: BTreeMap<FrameKey, (FrameRecord, Bytes)>,
    sessions: BTreeMap<String, PersistedSession>,
}

/// Process-local cold store, used when persistence is disabled
#[derive(Default)]
pub struct MemoryColdStore {
    state: Mutex<MemoryColdState>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put_frame` fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every `put_frame` before it takes effect
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn contains(&self, key: &FrameKey) -> bool {
        self.state.lock().frames.contains_key(key)
    }
}

#[async_trait]
impl ColdStore for MemoryColdStore {
    async fn put_frame(&self, record: &FrameRecord, image: &[u8]) -> Result<(), StoreError> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::ColdStoreWrite {
                key: record.image_ref.key.clone(),
                message: "write failure injected".to_string(),
            });
        }

        self.state.lock().frames.insert(
            record.key(),
            (record.clone(), Bytes::copy_from_slice(image)),
        );
        Ok(())
    }

    async fn get_frame(&self, key: &FrameKey) -> Result<Option<StoredFrame>, StoreError> {
        Ok(self
            .state
            .lock()
            .frames
            .get(key)
            .map(|(record, image)| into_persistent(record.clone(), image.clone())))
    }

    async fn get_frames(
        &self,
        session_id: &str,
        frame_ids: &[u64],
    ) -> Result<Vec<StoredFrame>, StoreError> {
        let state = self.state.lock();
        Ok(frame_ids
            .iter()
            .filter_map(|id| state.frames.get(&FrameKey::new(session_id, *id)))
            .map(|(record, image)| into_persistent(record.clone(), image.clone()))
            .collect())
    }

    async fn list_frame_records(&self, session_id: &str) -> Result<Vec<FrameRecord>, StoreError> {
        let state = self.state.lock();
        let mut records: Vec<FrameRecord> = state
            .frames
            .values()
            .filter(|(record, _)| record.session_id == session_id)
            .map(|(record, _)| {
                let mut record = record.clone();
                record.image_ref.tier = Tier::Persistent;
                record
            })
            .collect();
        records.sort_by_key(|r| r.frame_id);
        Ok(records)
    }

    async fn put_session(&self, session: &PersistedSession) -> Result<(), StoreError> {
        self.state
            .lock()
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<PersistedSession>, StoreError> {
        let mut sessions: Vec<_> = self.state.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let deleted = state.frames.len() as u64;
        state.frames.clear();
        state.sessions.clear();
        Ok(deleted)
    }
}
