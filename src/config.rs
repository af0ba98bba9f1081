//! Runtime configuration
//!
//! Every field has a default so a partial JSON document is a valid
//! configuration. Durations are stored in milliseconds for readable files.

use crate::detector::DEFAULT_DIP_RATIO;
use crate::error::FocusError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default time allowed for device discovery
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 30_000;

/// Default calibration window
pub const DEFAULT_CALIBRATION_SECS: u64 = 120;

/// Default replay delay between rows
pub const DEFAULT_REPLAY_INTERVAL_MS: u64 = 1_000;

/// Configuration shared by the orchestrator, registry and sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Fraction of the baseline below which a sample is a dip
    pub dip_ratio: f64,
    /// Device discovery timeout (ms)
    pub discovery_timeout_ms: u64,
    /// Default calibration duration (seconds)
    pub calibration_duration_secs: u64,
    /// Period of calibration progress broadcasts (ms)
    pub calibration_progress_interval_ms: u64,
    /// Delay between replayed rows (ms)
    pub replay_interval_ms: u64,
    /// Poll period when tailing a recording (ms)
    pub tail_poll_ms: u64,
    /// Restart replay from the first row when exhausted
    pub loop_replay: bool,
    /// Per-subscriber outbound queue length
    pub subscriber_buffer: usize,
    /// Time a subscriber may take to accept a message before it is dropped (ms)
    pub delivery_timeout_ms: u64,
    /// Capacity of the channel between a source and its session pump
    pub source_channel_capacity: usize,
    /// Number of buffered samples that triggers a flush to storage
    pub recorder_flush_threshold: usize,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            dip_ratio: DEFAULT_DIP_RATIO,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            calibration_duration_secs: DEFAULT_CALIBRATION_SECS,
            calibration_progress_interval_ms: 1_000,
            replay_interval_ms: DEFAULT_REPLAY_INTERVAL_MS,
            tail_poll_ms: 500,
            loop_replay: false,
            subscriber_buffer: 256,
            delivery_timeout_ms: 2_000,
            source_channel_capacity: 128,
            recorder_flush_threshold: 100,
        }
    }
}

impl FocusConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, FocusError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Parse and validate configuration JSON
    pub fn from_json(json: &str) -> Result<Self, FocusError> {
        let config: FocusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to pretty JSON
    pub fn to_json(&self) -> Result<String, FocusError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), FocusError> {
        if !(self.dip_ratio.is_finite() && self.dip_ratio > 0.0) {
            return Err(FocusError::Config(format!(
                "dip_ratio must be positive, got {}",
                self.dip_ratio
            )));
        }
        let positive = [
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("calibration_duration_secs", self.calibration_duration_secs),
            ("calibration_progress_interval_ms", self.calibration_progress_interval_ms),
            ("replay_interval_ms", self.replay_interval_ms),
            ("tail_poll_ms", self.tail_poll_ms),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(FocusError::Config(format!("{} must be greater than zero", name)));
            }
        }
        let capacities = [
            ("subscriber_buffer", self.subscriber_buffer),
            ("source_channel_capacity", self.source_channel_capacity),
            ("recorder_flush_threshold", self.recorder_flush_threshold),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(FocusError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn calibration_duration(&self) -> Duration {
        Duration::from_secs(self.calibration_duration_secs)
    }

    pub fn calibration_progress_interval(&self) -> Duration {
        Duration::from_millis(self.calibration_progress_interval_ms)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn tail_poll(&self) -> Duration {
        Duration::from_millis(self.tail_poll_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FocusConfig::from_json(r#"{"dip_ratio": 0.6, "loop_replay": true}"#).unwrap();
        assert_eq!(config.dip_ratio, 0.6);
        assert!(config.loop_replay);
        assert_eq!(config.subscriber_buffer, FocusConfig::default().subscriber_buffer);
    }

    #[test]
    fn test_roundtrip() {
        let config = FocusConfig {
            tail_poll_ms: 250,
            ..Default::default()
        };
        let loaded = FocusConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.tail_poll(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            FocusConfig::from_json(r#"{"dip_ratio": 0.0}"#),
            Err(FocusError::Config(_))
        ));
        assert!(matches!(
            FocusConfig::from_json(r#"{"tail_poll_ms": 0}"#),
            Err(FocusError::Config(_))
        ));
        assert!(matches!(
            FocusConfig::from_json(r#"{"subscriber_buffer": 0}"#),
            Err(FocusError::Config(_))
        ));
        assert!(matches!(FocusConfig::from_json("{"), Err(FocusError::Json(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focus.json");
        std::fs::write(&path, r#"{"calibration_duration_secs": 30}"#).unwrap();
        let config = FocusConfig::load(&path).unwrap();
        assert_eq!(config.calibration_duration(), Duration::from_secs(30));
    }
}
