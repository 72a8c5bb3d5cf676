//! Frame data model and transport message decoding.
//!
//! Frame events arrive from the recognition pipeline either as JSON lines
//! (image payload base64-encoded) or as a binary pair of a JSON header
//! followed by the raw image bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

/// Errors raised while decoding transport messages.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed to decode frame message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Image size mismatch: header declares {expected} bytes, received {actual}")]
    ImageSizeMismatch { expected: usize, actual: usize },
}

/// Axis-aligned bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Kind of detected target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Face,
    Person,
}

/// A single detected target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Target id, unique within a frame
    pub id: u32,
    /// Target kind
    #[serde(rename = "type")]
    pub detection_type: DetectionType,
    /// Bounding box
    pub bbox: BoundingBox,
    /// Detector confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Face/person pairing, if the detector associated one
    #[serde(default, alias = "paired_id", skip_serializing_if = "Option::is_none")]
    pub paired_id: Option<u32>,
}

/// Emotion recognition result for one detected target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmotionResult {
    /// Detection this result belongs to
    #[serde(alias = "detection_id")]
    pub detection_id: u32,
    /// Probability per emotion label
    #[serde(default)]
    pub probabilities: BTreeMap<String, f32>,
    /// Label with the highest probability
    #[serde(alias = "dominant_emotion")]
    pub dominant_emotion: String,
    /// Recognizer confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// Dominant emotion of a frame as shown in the live view: the target with the
/// strictly greatest confidence, the first one seen winning ties.
pub fn dominant_by_confidence(emotions: &[EmotionResult]) -> Option<&str> {
    let mut best: Option<&EmotionResult> = None;
    for emotion in emotions {
        match best {
            Some(current) if emotion.confidence <= current.confidence => {}
            _ => best = Some(emotion),
        }
    }
    best.map(|e| e.dominant_emotion.as_str())
}

/// Dominant emotion of a frame as shown on the timeline: the most frequent
/// per-target dominant label, the first one seen winning ties.
pub fn dominant_by_votes(emotions: &[EmotionResult]) -> Option<String> {
    // (label, votes) in first-seen order
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for emotion in emotions {
        match tally
            .iter_mut()
            .find(|(label, _)| *label == emotion.dominant_emotion)
        {
            Some((_, votes)) => *votes += 1,
            None => tally.push((emotion.dominant_emotion.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (label, votes) in tally {
        match best {
            Some((_, best_votes)) if votes <= best_votes => {}
            _ => best = Some((label, votes)),
        }
    }
    best.map(|(label, _)| label.to_string())
}

/// A frame event as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameEvent {
    /// Session the upstream attributed this frame to
    #[serde(default, alias = "session_id")]
    pub session_id: String,
    /// Frame id, monotonically increasing per session
    #[serde(alias = "frame_id")]
    pub frame_id: u64,
    /// Capture timestamp in milliseconds
    #[serde(alias = "timestamp_ms")]
    pub timestamp_ms: f64,
    /// Detected targets
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Per-target emotion results
    #[serde(default)]
    pub emotions: Vec<EmotionResult>,
    /// Encoded image (JPEG/PNG), base64 in JSON form
    #[serde(default, alias = "image", with = "base64_serde")]
    pub image_bytes: Bytes,
}

impl FrameEvent {
    /// Dominant emotion used by the retention policy.
    pub fn dominant_emotion(&self) -> Option<&str> {
        dominant_by_confidence(&self.emotions)
    }
}

/// Base64 serialization helper for image payloads
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// JSON header preceding a binary image payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryFrameHeader {
    #[serde(default, alias = "session_id")]
    pub session_id: String,
    #[serde(alias = "frame_id")]
    pub frame_id: u64,
    #[serde(alias = "timestamp_ms")]
    pub timestamp_ms: f64,
    #[serde(alias = "image_size")]
    pub image_size: usize,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub emotions: Vec<EmotionResult>,
}

impl BinaryFrameHeader {
    /// Join the header with the image bytes that followed it.
    pub fn into_event(self, image: Bytes) -> Result<FrameEvent, FrameError> {
        if image.len() != self.image_size {
            return Err(FrameError::ImageSizeMismatch {
                expected: self.image_size,
                actual: image.len(),
            });
        }

        Ok(FrameEvent {
            session_id: self.session_id,
            frame_id: self.frame_id,
            timestamp_ms: self.timestamp_ms,
            detections: self.detections,
            emotions: self.emotions,
            image_bytes: image,
        })
    }
}

/// Lifecycle event names emitted by the upstream pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventName {
    Eos,
    RecordingStarted,
    RecordingStopped,
}

/// Why a stream lifecycle event happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventReason {
    SourceEof,
    UserStop,
    Error,
}

/// Stream lifecycle event (end of stream etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(default, alias = "session_id")]
    pub session_id: String,
    pub name: StreamEventName,
    #[serde(default)]
    pub reason: Option<StreamEventReason>,
    #[serde(default, alias = "frame_id")]
    pub frame_id: Option<u64>,
}

/// One line of the JSON transport stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportMessage {
    Frame(FrameEvent),
    Event(StreamEvent),
}

impl TransportMessage {
    pub fn from_json(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Storage tier a frame currently lives in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Persistent,
}

/// Identity of a retained frame across all sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey {
    pub session_id: String,
    pub frame_id: u64,
}

impl FrameKey {
    pub fn new(session_id: impl Into<String>, frame_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            frame_id,
        }
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.frame_id)
    }
}

/// Where and how a frame's image is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub tier: Tier,
    pub key: String,
    pub mime: String,
    pub byte_length: usize,
    pub width: u32,
    pub height: u32,
}

/// Basic facts about an encoded image, read from its header only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    /// Probe the image format and dimensions without decoding pixels.
    pub fn probe(data: &[u8]) -> Self {
        let mime = match image::guess_format(data) {
            Ok(format) => format.to_mime_type().to_string(),
            Err(_) => "application/octet-stream".to_string(),
        };

        let (width, height) = image::ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok())
            .unwrap_or((0, 0));

        Self {
            mime,
            width,
            height,
        }
    }
}

/// Metadata of a retained frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameRecord {
    pub session_id: String,
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub detections: Vec<Detection>,
    pub emotion_results: Vec<EmotionResult>,
    pub image_ref: ImageRef,
}

impl FrameRecord {
    /// Build the record for a freshly retained event, resident in memory.
    pub fn from_event(event: &FrameEvent) -> Self {
        let key = FrameKey::new(event.session_id.clone(), event.frame_id);
        let info = ImageInfo::probe(&event.image_bytes);

        Self {
            session_id: event.session_id.clone(),
            frame_id: event.frame_id,
            timestamp_ms: event.timestamp_ms,
            detections: event.detections.clone(),
            emotion_results: event.emotions.clone(),
            image_ref: ImageRef {
                tier: Tier::Memory,
                key: key.to_string(),
                mime: info.mime,
                byte_length: event.image_bytes.len(),
                width: info.width,
                height: info.height,
            },
        }
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.session_id.clone(), self.frame_id)
    }
}

/// A retained frame read back from either tier.
#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub record: FrameRecord,
    pub image: Bytes,
}

impl StoredFrame {
    pub fn tier(&self) -> Tier {
        self.record.image_ref.tier
    }
}
