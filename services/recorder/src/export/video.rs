//! Video backend seam and the two encoding strategies.
//!
//! The codec path feeds decoded samples with synthetic timestamps into a
//! muxed-container writer. The fallback path draws each frame onto a live
//! stream recorder in real time and concatenates the recorder's chunks.

use super::{ExportError, ExportState, StatusReporter};
use crate::frame::StoredFrame;
use async_trait::async_trait;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by video backends
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Backend initialization failed: {0}")]
    Init(String),

    #[error("Pipeline creation failed: {0}")]
    Pipeline(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Not supported by this backend: {0}")]
    Unsupported(String),
}

/// Host capability flags, probed once
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub codec_encoder: bool,
    pub stream_recorder: bool,
    /// Informational only
    pub shared_memory: bool,
    pub secure_context: bool,
}

impl PlatformCapabilities {
    pub fn codec_path_available(&self) -> bool {
        self.codec_encoder && self.secure_context
    }

    pub fn fallback_available(&self) -> bool {
        self.stream_recorder
    }
}

/// Output container of a video export
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    /// Codec path
    Mp4,
    /// Fallback path
    Webm,
}

impl VideoContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            VideoContainer::Mp4 => "mp4",
            VideoContainer::Webm => "webm",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            VideoContainer::Mp4 => "video/mp4",
            VideoContainer::Webm => "video/webm",
        }
    }
}

/// A decoded RGBA frame
#[derive(Debug, Clone)]
pub struct RawSample {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub timestamp: Duration,
}

impl RawSample {
    /// Decode an encoded image, scaling it to `size` if given
    pub fn decode(
        encoded: &[u8],
        timestamp: Duration,
        size: Option<(u32, u32)>,
    ) -> Result<Self, image::ImageError> {
        let mut rgba = image::load_from_memory(encoded)?.to_rgba8();
        if let Some((width, height)) = size {
            if rgba.dimensions() != (width, height) {
                rgba = image::imageops::resize(&rgba, width, height, FilterType::Triangle);
            }
        }

        let (width, height) = rgba.dimensions();
        Ok(Self {
            width,
            height,
            data: rgba.into_raw(),
            timestamp,
        })
    }
}

/// Muxed container writer with one video track
#[async_trait]
pub trait MuxedVideoWriter: Send {
    async fn append(&mut self, sample: RawSample) -> Result<(), VideoError>;

    /// Finish the container and return its bytes
    async fn finalize(self: Box<Self>) -> Result<Vec<u8>, VideoError>;
}

/// Real-time recorder of a drawn surface
#[async_trait]
pub trait StreamRecorder: Send {
    async fn draw(&mut self, sample: &RawSample) -> Result<(), VideoError>;

    /// Stop recording and return the output chunks in order
    async fn stop(self: Box<Self>) -> Result<Vec<Vec<u8>>, VideoError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait VideoBackend: Send + Sync {
    fn capabilities(&self) -> PlatformCapabilities;

    fn open_muxer(
        &self,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn MuxedVideoWriter>, VideoError>;

    fn open_recorder(
        &self,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn StreamRecorder>, VideoError>;
}

/// Backend for hosts without any video support
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl VideoBackend for UnsupportedBackend {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::default()
    }

    fn open_muxer(&self, _: u32, _: u32, _: f64) -> Result<Box<dyn MuxedVideoWriter>, VideoError> {
        Err(VideoError::Unsupported("muxed video writer".to_string()))
    }

    fn open_recorder(&self, _: u32, _: u32, _: f64) -> Result<Box<dyn StreamRecorder>, VideoError> {
        Err(VideoError::Unsupported("stream recorder".to_string()))
    }
}

/// Best backend this build supports
pub fn default_backend() -> Arc<dyn VideoBackend> {
    #[cfg(feature = "gstreamer")]
    {
        match super::gst::GstBackend::new() {
            Ok(backend) => return Arc::new(backend),
            Err(e) => warn!(error = %e, "GStreamer unavailable, video export disabled"),
        }
    }

    Arc::new(UnsupportedBackend)
}

fn sample_timestamp(index: usize, fps: f64) -> Duration {
    Duration::from_secs_f64(index as f64 / fps)
}

/// Codec path: decode, stamp `index / fps`, append, finalize.
///
/// The first frame fixes the output dimensions, so it must be readable.
/// Later unreadable frames are skipped; their slot in the timeline stays
/// empty.
pub(crate) async fn encode_muxed(
    backend: &dyn VideoBackend,
    frames: &[Option<StoredFrame>],
    fps: f64,
    status: &StatusReporter,
) -> Result<Vec<u8>, ExportError> {
    status.update(ExportState::Encoding, 0.0);

    let first = frames
        .first()
        .and_then(|f| f.as_ref())
        .ok_or_else(|| ExportError::ReadFailure("first frame is unreadable".to_string()))?;
    let first = RawSample::decode(&first.image, Duration::ZERO, None).map_err(|e| {
        ExportError::ReadFailure(format!("first frame could not be decoded: {e}"))
    })?;

    let size = (first.width, first.height);
    let mut writer = backend
        .open_muxer(size.0, size.1, fps)
        .map_err(|e| ExportError::EncodeFailure(e.to_string()))?;

    let total = frames.len();
    let mut pending = Some(first);
    for (index, frame) in frames.iter().enumerate() {
        let sample = match (index, pending.take()) {
            (0, Some(sample)) => Some(sample),
            _ => frame.as_ref().and_then(|frame| {
                RawSample::decode(&frame.image, sample_timestamp(index, fps), Some(size))
                    .map_err(|e| warn!(index, error = %e, "Skipping undecodable frame"))
                    .ok()
            }),
        };

        match sample {
            Some(sample) => writer
                .append(sample)
                .await
                .map_err(|e| ExportError::EncodeFailure(e.to_string()))?,
            None => debug!(index, "Skipping missing frame"),
        }

        status.update(ExportState::Encoding, 0.9 * (index + 1) as f32 / total as f32);
    }

    status.update(ExportState::Muxing, 0.9);
    let bytes = writer
        .finalize()
        .await
        .map_err(|e| ExportError::EncodeFailure(e.to_string()))?;

    info!(frames = total, bytes = bytes.len(), "Muxed video encoded");
    Ok(bytes)
}

/// Fallback path: draw every readable frame at wall-clock pace.
pub(crate) async fn record_stream(
    backend: &dyn VideoBackend,
    frames: &[Option<StoredFrame>],
    fps: f64,
    status: &StatusReporter,
) -> Result<Vec<u8>, ExportError> {
    status.update(ExportState::Encoding, 0.0);

    let mut samples = frames.iter().enumerate().filter_map(|(index, frame)| {
        let frame = frame.as_ref()?;
        RawSample::decode(&frame.image, sample_timestamp(index, fps), None)
            .map_err(|e| warn!(index, error = %e, "Skipping undecodable frame"))
            .ok()
            .map(|sample| (index, sample))
    });

    let (first_index, first) = samples
        .next()
        .ok_or_else(|| ExportError::ReadFailure("no readable frames".to_string()))?;
    let size = (first.width, first.height);

    let mut recorder = backend
        .open_recorder(size.0, size.1, fps)
        .map_err(|e| ExportError::EncodeFailure(e.to_string()))?;

    let pacing = Duration::from_secs_f64(1.0 / fps);
    let total = frames.len();

    for (index, mut sample) in std::iter::once((first_index, first)).chain(samples) {
        if (sample.width, sample.height) != size {
            sample = rescale(sample, size);
        }
        recorder
            .draw(&sample)
            .await
            .map_err(|e| ExportError::EncodeFailure(e.to_string()))?;
        status.update(ExportState::Encoding, (index + 1) as f32 / total as f32);
        tokio::time::sleep(pacing).await;
    }

    let chunks = recorder
        .stop()
        .await
        .map_err(|e| ExportError::EncodeFailure(e.to_string()))?;
    let bytes = chunks.concat();

    info!(frames = total, bytes = bytes.len(), "Stream recording finished");
    Ok(bytes)
}

fn rescale(sample: RawSample, (width, height): (u32, u32)) -> RawSample {
    match image::RgbaImage::from_raw(sample.width, sample.height, sample.data) {
        Some(rgba) => RawSample {
            width,
            height,
            data: image::imageops::resize(&rgba, width, height, FilterType::Triangle).into_raw(),
            timestamp: sample.timestamp,
        },
        None => RawSample {
            width,
            height,
            data: vec![0; (width * height * 4) as usize],
            timestamp: sample.timestamp,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(width, height))
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_to_rgba() {
        let sample = RawSample::decode(&png(4, 3), Duration::from_millis(40), None).unwrap();
        assert_eq!((sample.width, sample.height), (4, 3));
        assert_eq!(sample.data.len(), 4 * 3 * 4);
        assert_eq!(sample.timestamp, Duration::from_millis(40));
    }

    #[test]
    fn test_decode_scales_to_requested_size() {
        let sample = RawSample::decode(&png(8, 8), Duration::ZERO, Some((4, 2))).unwrap();
        assert_eq!((sample.width, sample.height), (4, 2));
        assert_eq!(sample.data.len(), 4 * 2 * 4);
    }

    #[test]
    fn test_sample_timestamps_follow_index() {
        assert_eq!(sample_timestamp(0, 10.0), Duration::ZERO);
        assert_eq!(sample_timestamp(5, 10.0), Duration::from_millis(500));
    }

    #[test]
    fn test_capability_rules() {
        let caps = PlatformCapabilities {
            codec_encoder: true,
            stream_recorder: false,
            shared_memory: false,
            secure_context: false,
        };
        assert!(!caps.codec_path_available());
        assert!(!caps.fallback_available());
        assert!(!UnsupportedBackend.capabilities().codec_path_available());
    }
}
