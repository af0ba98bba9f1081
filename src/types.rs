//! Core types for the Focus Flux pipeline
//!
//! This module defines the data structures that flow between the stages of the
//! pipeline: raw device samples, metric events, sessions and exercise triggers.

use crate::error::FocusError;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a monitoring session
pub type SessionId = u64;

/// Named numeric metrics carried alongside the concentration value
pub type MetricBundle = BTreeMap<String, f64>;

/// Name of the metric every sample must carry
pub const CONCENTRATION_FIELD: &str = "concentration";

/// Timestamp as delivered by a source collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleTime {
    /// Seconds since the Unix epoch
    Seconds(f64),
    /// ISO-8601 / RFC 3339 timestamp
    Iso(String),
}

impl SampleTime {
    /// Resolve into a UTC timestamp
    pub fn to_datetime(&self) -> Result<DateTime<Utc>, FocusError> {
        match self {
            SampleTime::Seconds(secs) => {
                if !secs.is_finite() {
                    return Err(FocusError::MalformedRecord(format!(
                        "non-finite timestamp {}",
                        secs
                    )));
                }
                let millis = (secs * 1000.0).round() as i64;
                Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                    FocusError::MalformedRecord(format!("timestamp out of range: {}", secs))
                })
            }
            SampleTime::Iso(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    FocusError::MalformedRecord(format!("invalid timestamp {:?}: {}", text, e))
                }),
        }
    }
}

/// A single sample pushed by a source collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: SampleTime,
    pub metrics: MetricBundle,
}

impl RawSample {
    pub fn new(timestamp: SampleTime, metrics: MetricBundle) -> Self {
        Self { timestamp, metrics }
    }
}

/// One concentration reading with its auxiliary metrics
///
/// Created by a source and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub session_id: SessionId,
    /// Strictly increasing per source instance, starting at 1
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub concentration: f64,
    /// Every other metric of the bundle, preserved opaquely
    pub auxiliary: MetricBundle,
}

impl MetricEvent {
    /// Build an event from a metric bundle, extracting the concentration field.
    ///
    /// Fails with `MalformedRecord` when the bundle has no finite concentration.
    pub fn from_bundle(
        session_id: SessionId,
        sequence_number: u64,
        timestamp: DateTime<Utc>,
        mut bundle: MetricBundle,
    ) -> Result<Self, FocusError> {
        let concentration = bundle.remove(CONCENTRATION_FIELD).ok_or_else(|| {
            FocusError::MalformedRecord("missing concentration field".to_string())
        })?;
        if !concentration.is_finite() {
            return Err(FocusError::MalformedRecord(format!(
                "non-finite concentration {}",
                concentration
            )));
        }

        Ok(Self {
            session_id,
            sequence_number,
            timestamp,
            concentration,
            auxiliary: bundle,
        })
    }

    /// Build an event from a raw collaborator sample
    pub fn from_sample(
        session_id: SessionId,
        sequence_number: u64,
        sample: RawSample,
    ) -> Result<Self, FocusError> {
        let timestamp = sample.timestamp.to_datetime()?;
        Self::from_bundle(session_id, sequence_number, timestamp, sample.metrics)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Calibrating,
    Streaming,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Calibrating => "calibrating",
            SessionState::Streaming => "streaming",
            SessionState::Ended => "ended",
        }
    }

    /// Whether a source is expected to be running in this state
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Calibrating | SessionState::Streaming)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Streaming)
                | (Streaming, Calibrating)
                | (Calibrating, Streaming)
                | (Streaming, Idle)
                | (Calibrating, Idle)
                | (Idle, Ended)
                | (Streaming, Ended)
                | (Calibrating, Ended)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session boundary information found in a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "time", rename_all = "snake_case")]
pub enum SessionMarker {
    Started(NaiveTime),
    Stopped(NaiveTime),
}

/// A monitoring run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub baseline_concentration: Option<f64>,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of exercise triggers fired during this session
    pub focus_dips: u32,
    /// Start time announced by the recording, if any
    pub marker_start: Option<NaiveTime>,
    /// Stop time announced by the recording, if any
    pub marker_stop: Option<NaiveTime>,
}

impl Session {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            baseline_concentration: None,
            state: SessionState::Idle,
            started_at: None,
            ended_at: None,
            focus_dips: 0,
            marker_start: None,
            marker_stop: None,
        }
    }

    /// Move to `next`, rejecting transitions that would break monotonicity.
    pub fn transition(&mut self, next: SessionState, action: &'static str) -> Result<(), FocusError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(FocusError::InvalidSessionState {
                session_id: self.session_id,
                state: self.state.to_string(),
                action,
            });
        }
        match next {
            SessionState::Streaming if self.state == SessionState::Idle => {
                self.started_at = Some(Utc::now());
                self.ended_at = None;
            }
            SessionState::Ended => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Reopen an ended session so it can stream again. The baseline is kept.
    pub fn reopen(&mut self) -> Result<(), FocusError> {
        if self.state != SessionState::Ended {
            return Err(FocusError::InvalidSessionState {
                session_id: self.session_id,
                state: self.state.to_string(),
                action: "reopen",
            });
        }
        self.state = SessionState::Idle;
        self.marker_start = None;
        self.marker_stop = None;
        Ok(())
    }

    pub fn apply_marker(&mut self, marker: SessionMarker) {
        match marker {
            SessionMarker::Started(time) => self.marker_start = Some(time),
            SessionMarker::Stopped(time) => self.marker_stop = Some(time),
        }
    }
}

/// Notification that concentration dipped below the personal baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseTrigger {
    pub session_id: SessionId,
    pub triggered_at: DateTime<Utc>,
    pub concentration_at_trigger: f64,
    pub baseline_at_trigger: f64,
    /// Sequence number of the event that caused the trigger
    pub sequence_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(pairs: &[(&str, f64)]) -> MetricBundle {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_event_from_bundle_extracts_concentration() {
        let event = MetricEvent::from_bundle(
            7,
            1,
            Utc::now(),
            bundle(&[("concentration", 61.5), ("alpha", 0.4), ("heart_rate", 72.0)]),
        )
        .unwrap();

        assert_eq!(event.concentration, 61.5);
        assert_eq!(event.auxiliary.len(), 2);
        assert!(!event.auxiliary.contains_key("concentration"));
        assert_eq!(event.auxiliary.get("alpha"), Some(&0.4));
    }

    #[test]
    fn test_event_without_concentration_is_malformed() {
        let result = MetricEvent::from_bundle(1, 1, Utc::now(), bundle(&[("alpha", 0.4)]));
        assert!(matches!(result, Err(FocusError::MalformedRecord(_))));

        let result = MetricEvent::from_bundle(1, 1, Utc::now(), bundle(&[("concentration", f64::NAN)]));
        assert!(matches!(result, Err(FocusError::MalformedRecord(_))));
    }

    #[test]
    fn test_sample_time_formats() {
        let secs = SampleTime::Seconds(1_700_000_000.5).to_datetime().unwrap();
        assert_eq!(secs.timestamp_millis(), 1_700_000_000_500);

        let iso = SampleTime::Iso("2024-01-15T10:30:00Z".to_string())
            .to_datetime()
            .unwrap();
        assert_eq!(iso.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        assert!(SampleTime::Iso("yesterday".to_string()).to_datetime().is_err());
    }

    #[test]
    fn test_raw_sample_deserializes_either_timestamp() {
        let numeric: RawSample =
            serde_json::from_str(r#"{"timestamp": 12.5, "metrics": {"concentration": 50}}"#).unwrap();
        assert_eq!(numeric.timestamp, SampleTime::Seconds(12.5));

        let text: RawSample = serde_json::from_str(
            r#"{"timestamp": "2024-01-15T10:30:00Z", "metrics": {"concentration": 50}}"#,
        )
        .unwrap();
        assert!(matches!(text.timestamp, SampleTime::Iso(_)));
    }

    #[test]
    fn test_session_transitions() {
        let mut session = Session::new(3);
        session.transition(SessionState::Streaming, "stream").unwrap();
        assert!(session.started_at.is_some());

        session.transition(SessionState::Calibrating, "calibrate").unwrap();
        session.transition(SessionState::Streaming, "finish calibration").unwrap();
        session.transition(SessionState::Calibrating, "recalibrate").unwrap();
        session.transition(SessionState::Ended, "stop").unwrap();
        assert!(session.ended_at.is_some());

        let err = session.transition(SessionState::Streaming, "stream").unwrap_err();
        assert!(matches!(err, FocusError::InvalidSessionState { .. }));

        session.reopen().unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.reopen().is_err());
    }
}
