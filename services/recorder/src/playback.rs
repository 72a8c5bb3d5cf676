//! Jitter buffer for live frames.
//!
//! Frames are held for a fixed delay after arrival so the renderer can pull
//! at its own cadence. Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Playback buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            delay_ms: default_delay_ms(),
        }
    }
}

fn default_capacity() -> usize {
    8
}

fn default_delay_ms() -> u64 {
    100
}

/// Bounded queue of `(frame, arrival)` pairs
#[derive(Debug)]
pub struct PlaybackBuffer<T> {
    entries: VecDeque<(T, Instant)>,
    capacity: usize,
    delay: Duration,
}

impl<T> PlaybackBuffer<T> {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            delay,
        }
    }

    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self::new(config.capacity, Duration::from_millis(config.delay_ms))
    }

    /// Queue a frame, dropping the oldest one when full
    pub fn push(&mut self, frame: T, arrival: Instant) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((frame, arrival));
    }

    /// Newest frame that has waited at least the delay, discarding it and
    /// everything older. When nothing is due but the buffer is full, the
    /// oldest frame is released instead.
    pub fn get_playable_frame(&mut self, now: Instant) -> Option<T> {
        let due = self
            .entries
            .iter()
            .rposition(|(_, arrival)| now.saturating_duration_since(*arrival) >= self.delay);

        match due {
            Some(position) => {
                let (frame, _) = self.entries.drain(..=position).last()?;
                Some(frame)
            }
            None if self.entries.len() >= self.capacity => {
                self.entries.pop_front().map(|(frame, _)| frame)
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(100);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_returns_newest_due_frame_and_discards_older() {
        let start = Instant::now();
        let mut buffer = PlaybackBuffer::new(10, DELAY);
        buffer.push(1, start);
        buffer.push(2, start + ms(20));
        buffer.push(3, start + ms(40));
        buffer.push(4, start + ms(90));

        // 1..3 are due at +140, 4 is not
        assert_eq!(buffer.get_playable_frame(start + ms(140)), Some(3));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get_playable_frame(start + ms(150)), None);
        assert_eq!(buffer.get_playable_frame(start + ms(190)), Some(4));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_never_replays() {
        let start = Instant::now();
        let mut buffer = PlaybackBuffer::new(4, DELAY);
        buffer.push("a", start);

        assert_eq!(buffer.get_playable_frame(start + ms(200)), Some("a"));
        assert_eq!(buffer.get_playable_frame(start + ms(300)), None);
    }

    #[test]
    fn test_saturated_buffer_force_pops_oldest() {
        let start = Instant::now();
        let mut buffer = PlaybackBuffer::new(3, DELAY);
        for i in 0..3 {
            buffer.push(i, start + ms(i * 10));
        }

        assert_eq!(buffer.get_playable_frame(start + ms(30)), Some(0));
        assert_eq!(buffer.len(), 2);
        // no longer saturated, nothing due
        assert_eq!(buffer.get_playable_frame(start + ms(30)), None);
    }

    #[test]
    fn test_push_beyond_capacity_drops_oldest() {
        let start = Instant::now();
        let mut buffer = PlaybackBuffer::new(2, DELAY);
        buffer.push(1, start);
        buffer.push(2, start);
        buffer.push(3, start);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get_playable_frame(start + ms(100)), Some(3));
    }
}
