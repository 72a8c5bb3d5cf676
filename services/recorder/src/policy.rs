use crate::frame::FrameEvent;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// How incoming frames are selected for retention
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Keep every frame
    All,
    /// Keep frames at `sample_fps`, plus keyframes
    #[default]
    Sampled,
    /// Keep keyframes only
    Keyframes,
}

/// State changes that force a frame into retention
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyframeTriggers {
    /// Retain when the number of detections changes
    #[serde(default = "default_true")]
    pub on_detection_count_change: bool,
    /// Retain when the frame's dominant emotion changes
    #[serde(default = "default_true")]
    pub on_dominant_emotion_change: bool,
}

impl KeyframeTriggers {
    pub fn any_enabled(&self) -> bool {
        self.on_detection_count_change || self.on_dominant_emotion_change
    }
}

impl Default for KeyframeTriggers {
    fn default() -> Self {
        Self {
            on_detection_count_change: true,
            on_dominant_emotion_change: true,
        }
    }
}

/// Memory bounds of the hot tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageLimits {
    /// Maximum number of frames kept in memory
    #[serde(default = "default_max_hot_frames")]
    pub max_hot_frames: usize,
    /// Maximum total image bytes kept in memory
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_hot_frames: default_max_hot_frames(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// Recording policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingPolicy {
    #[serde(default)]
    pub mode: RecordingMode,
    /// Sampling rate for `sampled` mode
    #[serde(default = "default_sample_fps")]
    pub sample_fps: f64,
    #[serde(default)]
    pub keyframe_triggers: KeyframeTriggers,
    #[serde(default)]
    pub limits: StorageLimits,
    /// Spill to the durable on-disk store. When off, spilled frames stay in
    /// an unbounded in-process store and `max_bytes` only bounds the hot tier.
    #[serde(default = "default_true")]
    pub persist_cold_store: bool,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            mode: RecordingMode::default(),
            sample_fps: default_sample_fps(),
            keyframe_triggers: KeyframeTriggers::default(),
            limits: StorageLimits::default(),
            persist_cold_store: true,
        }
    }
}

impl RecordingPolicy {
    /// Minimum spacing between sampled frames in milliseconds
    pub fn sample_interval_ms(&self) -> f64 {
        1000.0 / self.sample_fps
    }
}

fn default_true() -> bool {
    true
}

fn default_sample_fps() -> f64 {
    5.0
}

fn default_max_hot_frames() -> usize {
    300
}

fn default_max_bytes() -> usize {
    200 * 1024 * 1024 // 200MB
}

/// Decision on whether to retain a frame
#[derive(Debug, Clone, PartialEq)]
pub enum RetentionDecision {
    /// Retain the frame with given reason
    Retain { reason: String },
    /// Skip the frame with given reason
    Skip { reason: String },
}

impl RetentionDecision {
    pub fn is_retain(&self) -> bool {
        matches!(self, RetentionDecision::Retain { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            RetentionDecision::Retain { reason } | RetentionDecision::Skip { reason } => reason,
        }
    }
}

/// Facts about the last retained frame
#[derive(Debug, Clone, Default, PartialEq)]
struct LastRetained {
    detection_count: usize,
    dominant_emotion: Option<String>,
    timestamp_ms: f64,
}

/// Decides which frames of a session are retained.
///
/// Comparisons are always made against the last *retained* frame: the
/// tracked state only moves forward through [`PolicyEvaluator::commit`].
pub struct PolicyEvaluator {
    policy: RecordingPolicy,
    last_retained: Option<LastRetained>,
}

impl PolicyEvaluator {
    /// Create a new evaluator with the given policy
    pub fn new(policy: RecordingPolicy) -> Self {
        Self {
            policy,
            last_retained: None,
        }
    }

    pub fn policy(&self) -> &RecordingPolicy {
        &self.policy
    }

    /// Determine if a frame should be retained
    pub fn evaluate(&self, event: &FrameEvent) -> RetentionDecision {
        let decision = match self.policy.mode {
            RecordingMode::All => RetentionDecision::Retain {
                reason: "Recording all frames".to_string(),
            },
            RecordingMode::Sampled => self.evaluate_sampled(event),
            RecordingMode::Keyframes => match self.keyframe_reason(event) {
                Some(reason) => RetentionDecision::Retain { reason },
                None => RetentionDecision::Skip {
                    reason: "Not a keyframe".to_string(),
                },
            },
        };

        trace!(
            frame_id = event.frame_id,
            retain = decision.is_retain(),
            reason = %decision.reason(),
            "Policy evaluated"
        );

        decision
    }

    /// Evaluate a frame in sampled mode
    fn evaluate_sampled(&self, event: &FrameEvent) -> RetentionDecision {
        let Some(last) = &self.last_retained else {
            return RetentionDecision::Retain {
                reason: "First frame of session".to_string(),
            };
        };

        let interval = self.policy.sample_interval_ms();
        let elapsed = event.timestamp_ms - last.timestamp_ms;

        if elapsed >= interval {
            return RetentionDecision::Retain {
                reason: format!("Periodic sample ({:.0}ms >= {:.0}ms)", elapsed, interval),
            };
        }

        match self.keyframe_reason(event) {
            Some(reason) => RetentionDecision::Retain { reason },
            None => RetentionDecision::Skip {
                reason: format!("Not sampled ({:.0}ms < {:.0}ms)", elapsed, interval),
            },
        }
    }

    /// Returns why the frame is a keyframe, if it is one
    fn keyframe_reason(&self, event: &FrameEvent) -> Option<String> {
        let triggers = &self.policy.keyframe_triggers;

        let Some(last) = &self.last_retained else {
            return triggers
                .any_enabled()
                .then(|| "First frame of session".to_string());
        };

        if triggers.on_detection_count_change && event.detections.len() != last.detection_count {
            return Some(format!(
                "Detection count changed: {} -> {}",
                last.detection_count,
                event.detections.len()
            ));
        }

        let dominant = event.dominant_emotion();
        if triggers.on_dominant_emotion_change && dominant != last.dominant_emotion.as_deref() {
            return Some(format!(
                "Dominant emotion changed: {} -> {}",
                last.dominant_emotion.as_deref().unwrap_or("none"),
                dominant.unwrap_or("none")
            ));
        }

        None
    }

    /// Record that `event` was retained. Must only be called for frames that
    /// were actually stored.
    pub fn commit(&mut self, event: &FrameEvent) {
        self.last_retained = Some(LastRetained {
            detection_count: event.detections.len(),
            dominant_emotion: event.dominant_emotion().map(str::to_string),
            timestamp_ms: event.timestamp_ms,
        });
    }

    /// Forget the tracked state (new session)
    pub fn reset(&mut self) {
        self.last_retained = None;
    }

    /// Timestamp of the last retained frame (useful for testing)
    pub fn last_retained_timestamp(&self) -> Option<f64> {
        self.last_retained.as_ref().map(|l| l.timestamp_ms)
    }
}

/// Builder for creating PolicyEvaluator with custom settings
pub struct PolicyEvaluatorBuilder {
    policy: RecordingPolicy,
}

impl PolicyEvaluatorBuilder {
    pub fn new() -> Self {
        Self {
            policy: RecordingPolicy::default(),
        }
    }

    pub fn mode(mut self, mode: RecordingMode) -> Self {
        self.policy.mode = mode;
        self
    }

    pub fn sample_fps(mut self, fps: f64) -> Self {
        self.policy.sample_fps = fps;
        self
    }

    pub fn on_detection_count_change(mut self, enabled: bool) -> Self {
        self.policy.keyframe_triggers.on_detection_count_change = enabled;
        self
    }

    pub fn on_dominant_emotion_change(mut self, enabled: bool) -> Self {
        self.policy.keyframe_triggers.on_dominant_emotion_change = enabled;
        self
    }

    pub fn build(self) -> PolicyEvaluator {
        PolicyEvaluator::new(self.policy)
    }
}

impl Default for PolicyEvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection, DetectionType, EmotionResult};
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn create_test_event(frame_id: u64, timestamp_ms: f64) -> FrameEvent {
        FrameEvent {
            session_id: "test-session".to_string(),
            frame_id,
            timestamp_ms,
            detections: vec![],
            emotions: vec![],
            image_bytes: Bytes::new(),
        }
    }

    fn with_detections(mut event: FrameEvent, count: usize) -> FrameEvent {
        event.detections = (0..count as u32)
            .map(|id| Detection {
                id,
                detection_type: DetectionType::Face,
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
                confidence: 0.9,
                paired_id: None,
            })
            .collect();
        event
    }

    fn with_emotion(mut event: FrameEvent, label: &str) -> FrameEvent {
        event.emotions = vec![EmotionResult {
            detection_id: 0,
            probabilities: BTreeMap::new(),
            dominant_emotion: label.to_string(),
            confidence: 0.8,
        }];
        event
    }

    /// Feed events through the evaluator the way the session manager does
    fn run(evaluator: &mut PolicyEvaluator, events: &[FrameEvent]) -> Vec<bool> {
        events
            .iter()
            .map(|event| {
                let retain = evaluator.evaluate(event).is_retain();
                if retain {
                    evaluator.commit(event);
                }
                retain
            })
            .collect()
    }

    #[test]
    fn test_all_mode_always_retains() {
        let mut evaluator = PolicyEvaluatorBuilder::new().mode(RecordingMode::All).build();
        let events: Vec<_> = (0..5).map(|i| create_test_event(i, i as f64)).collect();
        assert!(run(&mut evaluator, &events).iter().all(|r| *r));
    }

    #[test]
    fn test_sampled_mode_retains_one_in_five() {
        let mut evaluator = PolicyEvaluatorBuilder::new()
            .mode(RecordingMode::Sampled)
            .sample_fps(5.0)
            .build();

        let events: Vec<_> = (0..25)
            .map(|i| with_emotion(with_detections(create_test_event(i, i as f64 * 40.0), 1), "happy"))
            .collect();

        let retained = run(&mut evaluator, &events);
        let retained_ids: Vec<usize> = retained
            .iter()
            .enumerate()
            .filter(|(_, r)| **r)
            .map(|(i, _)| i)
            .collect();

        assert_eq!(retained_ids, vec![0, 5, 10, 15, 20]);
        assert_eq!(evaluator.last_retained_timestamp(), Some(800.0));
    }

    #[test]
    fn test_sampled_state_only_moves_on_retention() {
        let mut evaluator = PolicyEvaluatorBuilder::new().sample_fps(5.0).build();

        let first = create_test_event(0, 0.0);
        assert!(evaluator.evaluate(&first).is_retain());
        evaluator.commit(&first);

        // a dropped frame must not move the reference point
        let dropped = create_test_event(1, 150.0);
        assert!(!evaluator.evaluate(&dropped).is_retain());
        assert_eq!(evaluator.last_retained_timestamp(), Some(0.0));

        let next = create_test_event(2, 200.0);
        assert!(evaluator.evaluate(&next).is_retain());
    }

    #[test]
    fn test_sampled_mode_keyframe_bypasses_interval() {
        let mut evaluator = PolicyEvaluatorBuilder::new().sample_fps(1.0).build();

        let first = with_emotion(create_test_event(0, 0.0), "happy");
        evaluator.commit(&first);

        let changed = with_emotion(create_test_event(1, 40.0), "angry");
        match evaluator.evaluate(&changed) {
            RetentionDecision::Retain { reason } => {
                assert!(reason.contains("Dominant emotion changed"));
            }
            RetentionDecision::Skip { reason } => {
                panic!("Expected Retain, got Skip: {}", reason);
            }
        }
    }

    #[test]
    fn test_keyframes_on_detection_count_change() {
        let mut evaluator = PolicyEvaluatorBuilder::new()
            .mode(RecordingMode::Keyframes)
            .on_detection_count_change(true)
            .on_dominant_emotion_change(false)
            .build();

        let events: Vec<_> = [1, 1, 2, 2, 1]
            .iter()
            .enumerate()
            .map(|(i, count)| with_detections(create_test_event(i as u64, i as f64 * 40.0), *count))
            .collect();

        assert_eq!(run(&mut evaluator, &events), vec![true, false, true, false, true]);
    }

    #[test]
    fn test_keyframes_with_no_triggers_retains_nothing() {
        let mut evaluator = PolicyEvaluatorBuilder::new()
            .mode(RecordingMode::Keyframes)
            .on_detection_count_change(false)
            .on_dominant_emotion_change(false)
            .build();

        let events: Vec<_> = (0..3)
            .map(|i| with_detections(create_test_event(i, i as f64), i as usize))
            .collect();
        assert_eq!(run(&mut evaluator, &events), vec![false, false, false]);
    }

    #[test]
    fn test_reset_forgets_last_retained() {
        let mut evaluator = PolicyEvaluatorBuilder::new().build();
        let event = create_test_event(0, 0.0);
        evaluator.commit(&event);
        evaluator.reset();
        assert_eq!(evaluator.last_retained_timestamp(), None);
    }
}
