//! Session export: JSON results document and video containers.

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod video;

use crate::frame::{Detection, EmotionResult, StoredFrame};
use crate::session::{ExportSnapshot, SessionSummary};
use crate::store::TieredFrameStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use video::{PlatformCapabilities, VideoBackend, VideoContainer};

/// Version tag of the JSON results document
pub const RESULTS_VERSION: &str = "emovision-results-v1";

/// Share of JSON export progress spent reading frames
const JSON_READ_SHARE: f32 = 0.8;

/// Lowest accepted video frame rate
pub const MIN_TARGET_FPS: f64 = 0.01;

/// Export errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Frame read failed: {0}")]
    ReadFailure(String),

    #[error("Encoding failed: {0}")]
    EncodeFailure(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Session {0} has no frames")]
    EmptySession(String),

    #[error("Invalid target frame rate: {0}")]
    InvalidFps(f64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    #[default]
    Idle,
    /// Reading frames for the JSON document
    Building,
    Encoding,
    Muxing,
    Done,
    Error,
}

/// Progress of the current export, for display
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ExportStatus {
    pub state: ExportState,
    /// 0.0 - 1.0
    pub progress: f32,
    pub error: Option<String>,
}

fn check_fps(fps: f64) -> Result<(), ExportError> {
    if fps.is_finite() && fps >= MIN_TARGET_FPS {
        Ok(())
    } else {
        Err(ExportError::InvalidFps(fps))
    }
}

/// Publishes [`ExportStatus`] updates
pub(crate) struct StatusReporter {
    tx: watch::Sender<ExportStatus>,
}

impl StatusReporter {
    pub(crate) fn update(&self, state: ExportState, progress: f32) {
        self.tx.send_replace(ExportStatus {
            state,
            progress: progress.clamp(0.0, 1.0),
            error: None,
        });
    }

    fn fail(&self, error: &ExportError) {
        let progress = self.tx.borrow().progress;
        self.tx.send_replace(ExportStatus {
            state: ExportState::Error,
            progress,
            error: Some(error.to_string()),
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Video(VideoContainer),
}

/// A finished export
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ExportArtifact {
    fn new(format: ExportFormat, bytes: Vec<u8>) -> Self {
        let millis = Utc::now().timestamp_millis();
        let file_name = match format {
            ExportFormat::Json => format!("emovision-results-{millis}.json"),
            ExportFormat::Video(container) => {
                format!("emovision-{millis}.{}", container.extension())
            }
        };
        Self {
            format,
            file_name,
            bytes,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self.format {
            ExportFormat::Json => "application/json",
            ExportFormat::Video(container) => container.mime(),
        }
    }

    /// Write the artifact into `dir` under its file name
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.file_name);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

/// One frame of the results document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFrame {
    pub frame_id: u64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    pub emotions: Vec<EmotionResult>,
}

/// The JSON results document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsDocument {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub session: SessionSummary,
    pub frames: Vec<ExportedFrame>,
}

/// Builds exports of ended sessions by reading back through the store
pub struct ExportPipeline {
    store: Arc<TieredFrameStore>,
    backend: Arc<dyn VideoBackend>,
    capabilities: PlatformCapabilities,
    status: StatusReporter,
}

impl ExportPipeline {
    /// Create the pipeline. Backend capabilities are probed here, once.
    pub fn new(store: Arc<TieredFrameStore>, backend: Arc<dyn VideoBackend>) -> Self {
        let capabilities = backend.capabilities();
        info!(?capabilities, "Video capabilities probed");

        let (tx, _) = watch::channel(ExportStatus::default());
        Self {
            store,
            backend,
            capabilities,
            status: StatusReporter { tx },
        }
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    pub fn subscribe(&self) -> watch::Receiver<ExportStatus> {
        self.status.tx.subscribe()
    }

    pub fn status(&self) -> ExportStatus {
        self.status.tx.borrow().clone()
    }

    /// Export the snapshot as a versioned JSON document, frames ascending
    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.summary.session_id))]
    pub async fn export_json(&self, snapshot: &ExportSnapshot) -> Result<ExportArtifact, ExportError> {
        let result = self.build_json(snapshot).await;
        self.finish(result, "json")
    }

    async fn build_json(&self, snapshot: &ExportSnapshot) -> Result<ExportArtifact, ExportError> {
        self.status.update(ExportState::Building, 0.0);

        let mut keys = snapshot.keys();
        keys.sort_by_key(|k| k.frame_id);

        let frames = self
            .store
            .batch_read(&keys, |p| {
                self.status.update(ExportState::Building, p * JSON_READ_SHARE)
            })
            .await;

        let missing = frames.iter().filter(|f| f.is_none()).count();
        if missing > 0 {
            warn!(missing, "Unreadable frames skipped in JSON export");
        }

        let document = ResultsDocument {
            version: RESULTS_VERSION.to_string(),
            exported_at: Utc::now(),
            session: snapshot.summary.clone(),
            frames: frames
                .into_iter()
                .flatten()
                .map(|StoredFrame { record, .. }| ExportedFrame {
                    frame_id: record.frame_id,
                    timestamp: record.timestamp_ms,
                    detections: record.detections,
                    emotions: record.emotion_results,
                })
                .collect(),
        };

        let bytes = serde_json::to_vec_pretty(&document)?;
        Ok(ExportArtifact::new(ExportFormat::Json, bytes))
    }

    /// Export as video, preferring the codec path and falling back to the
    /// stream recorder if it is unavailable or fails.
    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.summary.session_id))]
    pub async fn download_video(
        &self,
        snapshot: &ExportSnapshot,
        fps: f64,
    ) -> Result<ExportArtifact, ExportError> {
        let result = self.encode_with_fallback(snapshot, fps).await;
        self.finish(result, "video")
    }

    async fn encode_with_fallback(
        &self,
        snapshot: &ExportSnapshot,
        fps: f64,
    ) -> Result<ExportArtifact, ExportError> {
        check_fps(fps)?;
        let frames = self.read_video_frames(snapshot).await?;

        let codec_error = if self.capabilities.codec_path_available() {
            match video::encode_muxed(self.backend.as_ref(), &frames, fps, &self.status).await {
                Ok(bytes) => {
                    return Ok(ExportArtifact::new(
                        ExportFormat::Video(VideoContainer::Mp4),
                        bytes,
                    ))
                }
                Err(e) => {
                    warn!(error = %e, "Codec path failed, falling back to stream recorder");
                    metrics::counter!("recorder.export.fallbacks").increment(1);
                    Some(e)
                }
            }
        } else {
            None
        };

        if self.capabilities.fallback_available() {
            let bytes =
                video::record_stream(self.backend.as_ref(), &frames, fps, &self.status).await?;
            return Ok(ExportArtifact::new(
                ExportFormat::Video(VideoContainer::Webm),
                bytes,
            ));
        }

        Err(codec_error.unwrap_or_else(|| {
            ExportError::CapabilityUnavailable("no video encoder available".to_string())
        }))
    }

    /// Forced codec path, no fallback
    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.summary.session_id))]
    pub async fn export_mp4(&self, snapshot: &ExportSnapshot, fps: f64) -> Result<ExportArtifact, ExportError> {
        let result: Result<ExportArtifact, ExportError> = async {
            check_fps(fps)?;
            if !self.capabilities.codec_path_available() {
                return Err(ExportError::CapabilityUnavailable(
                    "codec encoder in a secure context".to_string(),
                ));
            }
            let frames = self.read_video_frames(snapshot).await?;
            let bytes =
                video::encode_muxed(self.backend.as_ref(), &frames, fps, &self.status).await?;
            Ok(ExportArtifact::new(
                ExportFormat::Video(VideoContainer::Mp4),
                bytes,
            ))
        }
        .await;
        self.finish(result, "mp4")
    }

    /// Forced fallback path
    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.summary.session_id))]
    pub async fn export_webm(&self, snapshot: &ExportSnapshot, fps: f64) -> Result<ExportArtifact, ExportError> {
        let result: Result<ExportArtifact, ExportError> = async {
            check_fps(fps)?;
            if !self.capabilities.fallback_available() {
                return Err(ExportError::CapabilityUnavailable(
                    "stream recorder".to_string(),
                ));
            }
            let frames = self.read_video_frames(snapshot).await?;
            let bytes =
                video::record_stream(self.backend.as_ref(), &frames, fps, &self.status).await?;
            Ok(ExportArtifact::new(
                ExportFormat::Video(VideoContainer::Webm),
                bytes,
            ))
        }
        .await;
        self.finish(result, "webm")
    }

    async fn read_video_frames(
        &self,
        snapshot: &ExportSnapshot,
    ) -> Result<Vec<Option<StoredFrame>>, ExportError> {
        if snapshot.frame_ids.is_empty() {
            return Err(ExportError::EmptySession(
                snapshot.summary.session_id.clone(),
            ));
        }

        let mut keys = snapshot.keys();
        keys.sort_by_key(|k| k.frame_id);
        Ok(self.store.batch_read(&keys, |_| {}).await)
    }

    fn finish(
        &self,
        result: Result<ExportArtifact, ExportError>,
        kind: &'static str,
    ) -> Result<ExportArtifact, ExportError> {
        match &result {
            Ok(artifact) => {
                self.status.update(ExportState::Done, 1.0);
                metrics::counter!("recorder.export.completed", "kind" => kind).increment(1);
                info!(file = %artifact.file_name, bytes = artifact.bytes.len(), "Export finished");
            }
            Err(e) => {
                self.status.fail(e);
                metrics::counter!("recorder.export.failed", "kind" => kind).increment(1);
                warn!(error = %e, "Export failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::video::{MockVideoBackend, MuxedVideoWriter, RawSample, StreamRecorder, VideoError};
    use super::*;
    use crate::frame::FrameEvent;
    use crate::policy::{RecordingMode, RecordingPolicy};
    use crate::session::SessionManager;
    use crate::store::{MemoryColdStore, StoreSettings};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io::Cursor;

    struct FailingMuxer {
        appended: usize,
        fail_after: usize,
    }

    #[async_trait]
    impl MuxedVideoWriter for FailingMuxer {
        async fn append(&mut self, _sample: RawSample) -> Result<(), VideoError> {
            if self.appended == self.fail_after {
                return Err(VideoError::Encode("encoder crashed".to_string()));
            }
            self.appended += 1;
            Ok(())
        }

        async fn finalize(self: Box<Self>) -> Result<Vec<u8>, VideoError> {
            Ok(b"mp4".to_vec())
        }
    }

    #[derive(Default)]
    struct ChunkRecorder {
        chunks: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl StreamRecorder for ChunkRecorder {
        async fn draw(&mut self, sample: &RawSample) -> Result<(), VideoError> {
            self.chunks.push(vec![sample.width as u8]);
            Ok(())
        }

        async fn stop(self: Box<Self>) -> Result<Vec<Vec<u8>>, VideoError> {
            Ok(self.chunks)
        }
    }

    fn png(width: u32, height: u32) -> Bytes {
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(width, height))
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(buf.into_inner())
    }

    fn all_caps() -> PlatformCapabilities {
        PlatformCapabilities {
            codec_encoder: true,
            stream_recorder: true,
            shared_memory: false,
            secure_context: true,
        }
    }

    /// Record an ended session of `count` frames, the first one optionally
    /// unreadable
    async fn create_test_session(
        count: u64,
        corrupt_first: bool,
    ) -> (Arc<TieredFrameStore>, ExportSnapshot) {
        let settings = StoreSettings {
            max_hot_frames: 4,
            max_bytes: 1_000_000,
            persist_cold_store: false,
            spill_queue_capacity: 16,
            cold_read_batch_size: 3,
        };
        let store = Arc::new(TieredFrameStore::new(
            settings,
            Arc::new(MemoryColdStore::new()),
        ));
        let policy = RecordingPolicy {
            mode: RecordingMode::All,
            ..RecordingPolicy::default()
        };
        let manager = SessionManager::new(store.clone(), policy);

        let id = manager.start("video:clip.mp4").unwrap();
        for frame_id in 0..count {
            let image = if corrupt_first && frame_id == 0 {
                Bytes::from_static(b"not an image")
            } else {
                png(8, 6)
            };
            manager
                .ingest(FrameEvent {
                    session_id: id.clone(),
                    frame_id,
                    timestamp_ms: frame_id as f64 * 40.0,
                    detections: vec![],
                    emotions: vec![],
                    image_bytes: image,
                })
                .await
                .unwrap();
        }
        manager.mark_ended().unwrap();
        manager.flush().await.unwrap();

        let snapshot = manager.export_snapshot(&id).unwrap();
        (store, snapshot)
    }

    fn create_backend(caps: PlatformCapabilities, fail_after: usize) -> MockVideoBackend {
        let mut backend = MockVideoBackend::new();
        backend.expect_capabilities().return_const(caps);
        backend.expect_open_muxer().returning(move |_, _, _| {
            Ok(Box::new(FailingMuxer {
                appended: 0,
                fail_after,
            }) as Box<dyn MuxedVideoWriter>)
        });
        backend
            .expect_open_recorder()
            .returning(|_, _, _| Ok(Box::new(ChunkRecorder::default()) as Box<dyn StreamRecorder>));
        backend
    }

    #[tokio::test]
    async fn test_json_export_of_ten_frames() {
        let (store, snapshot) = create_test_session(10, false).await;
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(all_caps(), usize::MAX)));

        let artifact = pipeline.export_json(&snapshot).await.unwrap();
        assert_eq!(artifact.format, ExportFormat::Json);
        assert!(artifact.file_name.starts_with("emovision-results-"));
        assert!(artifact.file_name.ends_with(".json"));

        let document: ResultsDocument = serde_json::from_slice(&artifact.bytes).unwrap();
        assert_eq!(document.version, "emovision-results-v1");
        assert_eq!(document.frames.len(), 10);
        assert!(document.frames.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
        assert_eq!(document.session.session_id, snapshot.summary.session_id);

        let status = pipeline.status();
        assert_eq!(status.state, ExportState::Done);
        assert_eq!(status.progress, 1.0);
    }

    #[tokio::test]
    async fn test_codec_failure_falls_back_to_webm() {
        let (store, snapshot) = create_test_session(10, false).await;
        // fails on the 4th append, after 3 of 10 frames
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(all_caps(), 3)));

        let artifact = pipeline.download_video(&snapshot, 200.0).await.unwrap();
        assert_eq!(artifact.format, ExportFormat::Video(VideoContainer::Webm));
        assert!(artifact.file_name.ends_with(".webm"));
        assert_eq!(artifact.bytes, vec![8u8; 10]);
        assert_eq!(pipeline.status().state, ExportState::Done);
    }

    #[tokio::test]
    async fn test_codec_path_produces_mp4() {
        let (store, snapshot) = create_test_session(5, false).await;
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(all_caps(), usize::MAX)));

        let artifact = pipeline.download_video(&snapshot, 30.0).await.unwrap();
        assert_eq!(artifact.format, ExportFormat::Video(VideoContainer::Mp4));
        assert_eq!(artifact.bytes, b"mp4".to_vec());
        assert_eq!(artifact.mime(), "video/mp4");
    }

    #[tokio::test]
    async fn test_forced_export_fails_hard() {
        let (store, snapshot) = create_test_session(5, false).await;

        let pipeline = ExportPipeline::new(store.clone(), Arc::new(create_backend(all_caps(), 2)));
        let err = pipeline.export_mp4(&snapshot, 30.0).await.unwrap_err();
        assert!(matches!(err, ExportError::EncodeFailure(_)));
        let status = pipeline.status();
        assert_eq!(status.state, ExportState::Error);
        assert!(status.error.is_some());

        let no_codec = PlatformCapabilities {
            secure_context: false,
            ..all_caps()
        };
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(no_codec, usize::MAX)));
        let err = pipeline.export_mp4(&snapshot, 30.0).await.unwrap_err();
        assert!(matches!(err, ExportError::CapabilityUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreadable_first_frame_is_fatal_for_codec_path() {
        let (store, snapshot) = create_test_session(4, true).await;

        let mut backend = MockVideoBackend::new();
        backend.expect_capabilities().return_const(all_caps());
        backend.expect_open_muxer().times(0);
        let pipeline = ExportPipeline::new(store, Arc::new(backend));

        let err = pipeline.export_mp4(&snapshot, 30.0).await.unwrap_err();
        assert!(matches!(err, ExportError::ReadFailure(_)));
    }

    #[tokio::test]
    async fn test_fallback_skips_unreadable_frames() {
        let (store, snapshot) = create_test_session(4, true).await;
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(all_caps(), usize::MAX)));

        let artifact = pipeline.export_webm(&snapshot, 200.0).await.unwrap();
        assert_eq!(artifact.bytes.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_session_cannot_be_encoded() {
        let (store, snapshot) = create_test_session(0, false).await;
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(all_caps(), usize::MAX)));

        let err = pipeline.download_video(&snapshot, 30.0).await.unwrap_err();
        assert!(matches!(err, ExportError::EmptySession(_)));

        let artifact = pipeline.export_json(&snapshot).await.unwrap();
        let document: ResultsDocument = serde_json::from_slice(&artifact.bytes).unwrap();
        assert!(document.frames.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_frame_rate_is_an_error() {
        let (store, snapshot) = create_test_session(1, false).await;

        let mut backend = MockVideoBackend::new();
        backend.expect_capabilities().return_const(PlatformCapabilities {
            codec_encoder: false,
            ..all_caps()
        });
        backend.expect_open_muxer().times(0);
        backend.expect_open_recorder().times(0);
        let pipeline = ExportPipeline::new(store, Arc::new(backend));

        let err = pipeline.export_webm(&snapshot, 0.0).await.unwrap_err();
        assert!(matches!(err, ExportError::InvalidFps(fps) if fps == 0.0));
        let status = pipeline.status();
        assert_eq!(status.state, ExportState::Error);
        assert!(status.error.is_some());

        for fps in [-5.0, f64::NAN, f64::INFINITY, 1e-300] {
            let err = pipeline.download_video(&snapshot, fps).await.unwrap_err();
            assert!(matches!(err, ExportError::InvalidFps(_)));
        }
        let err = pipeline.export_mp4(&snapshot, -1.0).await.unwrap_err();
        assert!(matches!(err, ExportError::InvalidFps(_)));
    }

    #[tokio::test]
    async fn test_write_artifact_to_directory() {
        let (store, snapshot) = create_test_session(2, false).await;
        let pipeline = ExportPipeline::new(store, Arc::new(create_backend(all_caps(), usize::MAX)));
        let artifact = pipeline.export_json(&snapshot).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = artifact.write_to(dir.path()).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), artifact.bytes);
    }
}
