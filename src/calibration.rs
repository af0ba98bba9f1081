//! Baseline calibration
//!
//! A calibration run collects concentration samples for a fixed window and
//! turns them into the session's personal baseline (their arithmetic mean).
//!
//! Each session moves through `Idle -> Calibrating -> {Completed, Failed, Aborted}`.
//! Only one run per session may be active; a finished run is dropped as soon
//! as its result has been handed back.

use crate::error::FocusError;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Phase of a session's most recent calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Idle,
    Calibrating,
    Completed,
    Failed,
    Aborted,
}

/// A recorded calibration sample
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub value: f64,
    pub received_at: Instant,
}

/// An in-progress calibration
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub samples: Vec<CalibrationSample>,
    started: Instant,
    sum: f64,
    min: f64,
    max: f64,
}

impl CalibrationRun {
    fn new(session_id: SessionId, duration: Duration) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            duration,
            samples: Vec::new(),
            started: Instant::now(),
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples.push(CalibrationSample {
            value,
            received_at: Instant::now(),
        });
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// True once the configured window has passed
    pub fn is_due(&self) -> bool {
        self.elapsed() >= self.duration
    }

    fn progress(&self) -> CalibrationProgress {
        let elapsed = self.elapsed();
        let fraction = if self.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
        };
        let count = self.samples.len();

        CalibrationProgress {
            session_id: self.session_id,
            is_active: true,
            progress: fraction,
            elapsed_secs: elapsed.as_secs_f64(),
            remaining_secs: self.duration.saturating_sub(elapsed).as_secs_f64(),
            sample_count: count,
            mean: (count > 0).then(|| self.sum / count as f64),
            min: (count > 0).then_some(self.min),
            max: (count > 0).then_some(self.max),
            last_value: self.samples.last().map(|s| s.value),
        }
    }
}

/// Snapshot of a calibration's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProgress {
    pub session_id: SessionId,
    pub is_active: bool,
    /// Elapsed fraction of the window, clamped to [0, 1]
    pub progress: f64,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    pub sample_count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last_value: Option<f64>,
}

impl CalibrationProgress {
    fn inactive(session_id: SessionId) -> Self {
        Self {
            session_id,
            is_active: false,
            progress: 0.0,
            elapsed_secs: 0.0,
            remaining_secs: 0.0,
            sample_count: 0,
            mean: None,
            min: None,
            max: None,
            last_value: None,
        }
    }
}

/// Result of a completed calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub session_id: SessionId,
    /// Arithmetic mean of all samples
    pub baseline: f64,
    /// Population standard deviation
    pub std_deviation: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Whether the full window elapsed before completion
    pub full_window: bool,
}

/// Owns every session's active calibration run
#[derive(Debug, Default)]
pub struct CalibrationController {
    runs: HashMap<SessionId, CalibrationRun>,
    phases: HashMap<SessionId, CalibrationPhase>,
}

impl CalibrationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin collecting samples for `session_id`.
    ///
    /// Fails with `AlreadyCalibrating` if a run is active; that run is left untouched.
    pub fn start(&mut self, session_id: SessionId, duration: Duration) -> Result<(), FocusError> {
        if self.runs.contains_key(&session_id) {
            return Err(FocusError::AlreadyCalibrating(session_id));
        }
        self.runs.insert(session_id, CalibrationRun::new(session_id, duration));
        self.phases.insert(session_id, CalibrationPhase::Calibrating);
        Ok(())
    }

    pub fn is_calibrating(&self, session_id: SessionId) -> bool {
        self.runs.contains_key(&session_id)
    }

    /// Record a sample if `session_id` has an active run.
    ///
    /// Returns the updated progress, or `None` when no run is active.
    pub fn record(&mut self, session_id: SessionId, value: f64) -> Option<CalibrationProgress> {
        let run = self.runs.get_mut(&session_id)?;
        run.push(value);
        Some(run.progress())
    }

    pub fn progress(&self, session_id: SessionId) -> CalibrationProgress {
        self.runs
            .get(&session_id)
            .map(CalibrationRun::progress)
            .unwrap_or_else(|| CalibrationProgress::inactive(session_id))
    }

    /// True when the active run's window has passed
    pub fn is_due(&self, session_id: SessionId) -> bool {
        self.runs.get(&session_id).is_some_and(CalibrationRun::is_due)
    }

    /// Finish the active run and compute the baseline.
    ///
    /// The run ends whatever the outcome. With zero samples it fails with
    /// `EmptyCalibrationData` and the phase becomes `Failed`.
    pub fn complete(&mut self, session_id: SessionId) -> Result<CalibrationSummary, FocusError> {
        let run = self
            .runs
            .remove(&session_id)
            .ok_or(FocusError::NoActiveCalibration(session_id))?;

        if run.samples.is_empty() {
            self.phases.insert(session_id, CalibrationPhase::Failed);
            return Err(FocusError::EmptyCalibrationData(session_id));
        }

        let count = run.samples.len();
        let mean = run.sum / count as f64;
        let variance = run
            .samples
            .iter()
            .map(|s| (s.value - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        self.phases.insert(session_id, CalibrationPhase::Completed);
        Ok(CalibrationSummary {
            session_id,
            baseline: mean,
            std_deviation: variance.sqrt(),
            min: run.min,
            max: run.max,
            sample_count: count,
            started_at: run.started_at,
            completed_at: Utc::now(),
            full_window: run.is_due(),
        })
    }

    /// Drop the active run without computing a baseline.
    /// Returns whether a run was active.
    pub fn abort(&mut self, session_id: SessionId) -> bool {
        if self.runs.remove(&session_id).is_some() {
            self.phases.insert(session_id, CalibrationPhase::Aborted);
            true
        } else {
            false
        }
    }

    pub fn phase(&self, session_id: SessionId) -> CalibrationPhase {
        self.phases
            .get(&session_id)
            .copied()
            .unwrap_or(CalibrationPhase::Idle)
    }

    /// Release all bookkeeping for a session
    pub fn forget(&mut self, session_id: SessionId) {
        self.runs.remove(&session_id);
        self.phases.remove(&session_id);
    }
}
