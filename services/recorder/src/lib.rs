//! EmoVision Recorder
//!
//! Recording, retention and export engine for the EmoVision live
//! emotion-recognition dashboard. The recognition pipeline streams per-frame
//! detections and emotion scores; this crate decides which frames to keep,
//! holds them in a bounded two-tier store, tracks sessions and their
//! timelines, and exports ended sessions as a JSON results document or a
//! video container.
//!
//! ## Features
//!
//! - **Retention policy**: keep all frames, sample at a fixed rate, or keep
//!   keyframes only (detection count or dominant emotion changes)
//! - **Tiered storage**: bounded in-memory hot tier spilling to SQLite
//!   through a single FIFO spill queue, with atomic hot-to-cold handoff
//! - **Sessions**: start/pause/stop, end-of-stream handling, review of ended
//!   sessions, timeline scrubbing and emotion statistics, restore on startup
//! - **Export**: versioned JSON document, MP4 via a codec path with a live
//!   WebM recorder as fallback
//!
//! ## Architecture
//!
//! ```text
//! Transport (NDJSON)
//! ┌──────────────┐
//! │ FrameEvent / │
//! │ StreamEvent  │
//! └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ Session      │────▶│ Policy       │
//! │ Manager      │◀────│ Evaluator    │
//! └──────────────┘     └──────────────┘
//!        │  retained
//!        ▼
//! ┌──────────────┐ evict ┌──────────────┐ spill ┌──────────────┐
//! │ Hot tier     │──────▶│ Spill queue  │──────▶│ Cold store   │
//! │ (memory)     │       │ (FIFO)       │       │ (SQLite)     │
//! └──────────────┘       └──────────────┘       └──────────────┘
//!        │                                             │
//!        └──────────────────────┬──────────────────────┘
//!                               ▼ batch read
//!                        ┌──────────────┐
//!                        │ Export       │──▶ JSON / MP4 / WebM
//!                        │ Pipeline     │
//!                        └──────────────┘
//! ```

pub mod config;
pub mod export;
pub mod frame;
pub mod index;
pub mod playback;
pub mod policy;
pub mod session;
pub mod store;

pub use config::Config;
pub use export::video::{default_backend, PlatformCapabilities, VideoBackend, VideoContainer};
pub use export::{ExportArtifact, ExportError, ExportPipeline, ExportState, ExportStatus};
pub use frame::{FrameEvent, FrameKey, FrameRecord, StreamEvent, TransportMessage};
pub use index::{FrameIndex, TimelineCursor};
pub use playback::PlaybackBuffer;
pub use policy::{PolicyEvaluator, PolicyEvaluatorBuilder, RecordingMode, RecordingPolicy, RetentionDecision};
pub use session::{IngestOutcome, SessionError, SessionManager, SessionMode, SessionSummary};
pub use store::cold::ColdStore;
pub use store::{open_cold_store, MemoryColdStore, SqliteColdStore, StoreError, TieredFrameStore};
