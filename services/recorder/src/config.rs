use crate::playback::PlaybackConfig;
use crate::policy::RecordingPolicy;
use crate::store::StoreSettings;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration for the recorder service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Frame retention policy
    #[serde(default)]
    pub recording: RecordingPolicy,
    /// Tiered store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Live playback buffer
    #[serde(default)]
    pub playback: PlaybackConfig,
    /// Export configuration
    #[serde(default)]
    pub export: ExportConfig,
    /// Frame event input
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus exporter port; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Tiered store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL of the durable cold store
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Bounded spill queue length
    #[serde(default = "default_spill_queue_capacity")]
    pub spill_queue_capacity: usize,
    /// Frames per cold bulk read
    #[serde(default = "default_cold_read_batch_size")]
    pub cold_read_batch_size: usize,
}

/// Export configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    /// Directory exports are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Export video as well as JSON when a session ends
    #[serde(default = "default_true")]
    pub video: bool,
}

/// Frame event input
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// NDJSON file of transport messages; stdin when unset
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    /// Source descriptor recorded with the session
    #[serde(default)]
    pub source_descriptor: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "emovision-recorder".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_url() -> String {
    "sqlite://emovision.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_spill_queue_capacity() -> usize {
    64
}

fn default_cold_read_batch_size() -> usize {
    64
}

fn default_target_fps() -> f64 {
    10.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/recorder").required(false))
            .add_source(config::File::with_name("/etc/emovision/recorder").required(false))
            // Override with environment variables
            // EMOVISION__STORE__DATABASE_URL -> store.database_url
            .add_source(
                config::Environment::with_prefix("EMOVISION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("Failed to read {}", path.display()))?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let recording = &self.recording;
        if !(recording.sample_fps.is_finite() && recording.sample_fps > 0.0) {
            bail!("recording.sample_fps must be positive, got {}", recording.sample_fps);
        }
        if recording.limits.max_hot_frames == 0 {
            bail!("recording.limits.max_hot_frames must be at least 1");
        }
        if recording.limits.max_bytes == 0 {
            bail!("recording.limits.max_bytes must be positive");
        }
        if !(self.export.target_fps.is_finite() && self.export.target_fps > 0.0) {
            bail!("export.target_fps must be positive, got {}", self.export.target_fps);
        }
        if self.store.spill_queue_capacity == 0 {
            bail!("store.spill_queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Store sizing from the recording limits and store settings
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            spill_queue_capacity: self.store.spill_queue_capacity,
            cold_read_batch_size: self.store.cold_read_batch_size,
            ..StoreSettings::from_policy(&self.recording)
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            spill_queue_capacity: default_spill_queue_capacity(),
            cold_read_batch_size: default_cold_read_batch_size(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            output_dir: default_output_dir(),
            video: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RecordingMode;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recording.mode, RecordingMode::Sampled);
        assert_eq!(config.recording.sample_fps, 5.0);
        assert_eq!(config.recording.limits.max_hot_frames, 300);
        assert!(config.recording.persist_cold_store);
        assert_eq!(config.store.database_url, "sqlite://emovision.db");
        assert_eq!(config.service.metrics_port, None);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[service]
log_format = "pretty"
metrics_port = 9100

[recording]
mode = "keyframes"
sample_fps = 2.5
persist_cold_store = false

[recording.keyframe_triggers]
on_dominant_emotion_change = false

[recording.limits]
max_hot_frames = 50

[export]
target_fps = 24.0
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.service.log_format, LogFormat::Pretty);
        assert_eq!(config.service.metrics_port, Some(9100));
        assert_eq!(config.recording.mode, RecordingMode::Keyframes);
        assert!(config.recording.keyframe_triggers.on_detection_count_change);
        assert!(!config.recording.keyframe_triggers.on_dominant_emotion_change);
        assert_eq!(config.recording.limits.max_bytes, 200 * 1024 * 1024);

        let settings = config.store_settings();
        assert_eq!(settings.max_hot_frames, 50);
        assert!(!settings.persist_cold_store);
        assert_eq!(settings.spill_queue_capacity, 64);
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = Config::default();
        config.recording.sample_fps = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recording.limits.max_hot_frames = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.target_fps = f64::NAN;
        assert!(config.validate().is_err());
    }
}
