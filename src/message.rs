//! Subscriber-facing message shapes
//!
//! Outbound messages are values; encoding them for a particular transport is
//! the caller's concern. Both directions use an internal `type` tag.

use crate::calibration::{CalibrationPhase, CalibrationProgress, CalibrationSummary};
use crate::exercise::{Effectiveness, ExerciseInfo, ExerciseOutcome};
use crate::types::{ExerciseTrigger, MetricEvent, SessionId, SessionState};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ConcentrationUpdate {
        data: MetricEvent,
    },
    ExerciseSuggestion {
        data: ExerciseTrigger,
        exercises: Vec<ExerciseInfo>,
    },
    ExerciseResolved {
        data: ExerciseResolution,
    },
    CalibrationProgress {
        data: CalibrationProgress,
    },
    CalibrationCompleted {
        data: CalibrationSummary,
    },
    ConnectionEstablished {
        session_id: SessionId,
    },
    SourceFailed {
        session_id: SessionId,
        reason: String,
    },
    StreamStarted {
        session_id: SessionId,
        speed: f64,
    },
    StreamStopped {
        session_id: SessionId,
    },
    SpeedChanged {
        speed: f64,
        applied: bool,
    },
    CurrentMetrics {
        data: MetricsSnapshot,
    },
    Pong,
    Error {
        message: String,
    },
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    /// The `type` tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::ConcentrationUpdate { .. } => "concentration_update",
            OutboundMessage::ExerciseSuggestion { .. } => "exercise_suggestion",
            OutboundMessage::ExerciseResolved { .. } => "exercise_resolved",
            OutboundMessage::CalibrationProgress { .. } => "calibration_progress",
            OutboundMessage::CalibrationCompleted { .. } => "calibration_completed",
            OutboundMessage::ConnectionEstablished { .. } => "connection_established",
            OutboundMessage::SourceFailed { .. } => "source_failed",
            OutboundMessage::StreamStarted { .. } => "stream_started",
            OutboundMessage::StreamStopped { .. } => "stream_stopped",
            OutboundMessage::SpeedChanged { .. } => "speed_changed",
            OutboundMessage::CurrentMetrics { .. } => "current_metrics",
            OutboundMessage::Pong => "pong",
            OutboundMessage::Error { .. } => "error",
        }
    }
}

/// Commands a subscriber may send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    StartStream {
        /// Seconds between replayed rows
        #[serde(default)]
        speed: Option<f64>,
    },
    StopStream,
    SetSpeed {
        speed: f64,
    },
    GetMetrics,
    Ping,
}

/// Command type tags understood by [`InboundCommand`]
pub const COMMAND_TYPES: &[&str] = &["start_stream", "stop_stream", "set_speed", "get_metrics", "ping"];

/// Result of an exercise once the user finished or skipped it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseResolution {
    pub session_id: SessionId,
    pub outcome: ExerciseOutcome,
    pub concentration_before: f64,
    pub concentration_after: Option<f64>,
    pub effectiveness: Option<Effectiveness>,
    pub resolved_at: DateTime<Utc>,
}

/// Answer to `get_metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub is_streaming: bool,
    pub baseline_concentration: Option<f64>,
    pub latest: Option<MetricEvent>,
    pub total_points: u64,
    pub focus_dips: u32,
    pub trigger_outstanding: bool,
    pub calibration_phase: CalibrationPhase,
    pub calibration: Option<CalibrationProgress>,
    pub session_start: Option<NaiveTime>,
    pub session_stop: Option<NaiveTime>,
}
