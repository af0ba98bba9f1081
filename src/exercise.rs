//! Exercise suggestions
//!
//! When a dip fires, the orchestrator hands the trigger to an
//! [`ExerciseSuggester`]. The suggestion stays outstanding until the caller
//! reports how the exercise ended through `SessionOrchestrator::resolve_exercise`.

use crate::types::ExerciseTrigger;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Kind of exercise offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseKind {
    Breathing,
    Physical,
}

impl ExerciseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExerciseKind::Breathing => "breathing",
            ExerciseKind::Physical => "physical",
        }
    }
}

/// Description of an available exercise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseInfo {
    pub kind: ExerciseKind,
    pub name: String,
    pub description: String,
    pub duration_secs: u32,
    pub instructions: Vec<String>,
}

/// Exercises offered after a dip
pub fn available_exercises() -> Vec<ExerciseInfo> {
    vec![
        ExerciseInfo {
            kind: ExerciseKind::Breathing,
            name: "Breathing exercise".to_string(),
            description: "Slow, deep breathing to restore focus".to_string(),
            duration_secs: 60,
            instructions: vec![
                "Sit comfortably and close your eyes".to_string(),
                "Inhale through the nose for 4 seconds".to_string(),
                "Hold the breath for 7 seconds".to_string(),
                "Exhale slowly through the mouth for 8 seconds".to_string(),
                "Repeat 5-7 times".to_string(),
            ],
        },
        ExerciseInfo {
            kind: ExerciseKind::Physical,
            name: "Physical warm-up".to_string(),
            description: "A short warm-up to improve circulation".to_string(),
            duration_secs: 90,
            instructions: vec![
                "Stand up and stretch your arms overhead".to_string(),
                "Roll your shoulders 5-10 times".to_string(),
                "Rotate your head slowly 3-5 times".to_string(),
                "Do 5-10 squats".to_string(),
                "Stretch to each side".to_string(),
            ],
        },
    ]
}

/// How an outstanding exercise ended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseOutcome {
    Completed,
    Skipped,
}

/// Change in concentration across an exercise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effectiveness {
    High,
    Medium,
    Low,
    Neutral,
}

impl Effectiveness {
    /// Classify the improvement from `before` to `after`
    pub fn classify(before: Option<f64>, after: Option<f64>) -> Self {
        let (Some(before), Some(after)) = (before, after) else {
            return Effectiveness::Neutral;
        };
        let improvement = after - before;
        if improvement > 10.0 {
            Effectiveness::High
        } else if improvement > 5.0 {
            Effectiveness::Medium
        } else if improvement < -5.0 {
            Effectiveness::Low
        } else {
            Effectiveness::Neutral
        }
    }
}

/// Collaborator that presents an exercise to the user.
///
/// Called synchronously from the session's pump task, so implementations
/// must not block.
pub trait ExerciseSuggester: Send + Sync {
    fn suggest(&self, trigger: &ExerciseTrigger);
}

/// Suggester that only logs; used when no collaborator is configured
#[derive(Debug, Default)]
pub struct LoggingSuggester;

impl ExerciseSuggester for LoggingSuggester {
    fn suggest(&self, trigger: &ExerciseTrigger) {
        tracing::info!(
            session_id = trigger.session_id,
            concentration = trigger.concentration_at_trigger,
            baseline = trigger.baseline_at_trigger,
            "Exercise suggested"
        );
    }
}

/// Suggester that keeps every trigger it was handed
#[derive(Debug, Default)]
pub struct RecordingSuggester {
    triggers: Mutex<Vec<ExerciseTrigger>>,
}

impl RecordingSuggester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers(&self) -> Vec<ExerciseTrigger> {
        self.triggers
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl ExerciseSuggester for RecordingSuggester {
    fn suggest(&self, trigger: &ExerciseTrigger) {
        if let Ok(mut guard) = self.triggers.lock() {
            guard.push(trigger.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effectiveness_bands() {
        assert_eq!(Effectiveness::classify(Some(40.0), Some(55.0)), Effectiveness::High);
        assert_eq!(Effectiveness::classify(Some(40.0), Some(47.0)), Effectiveness::Medium);
        assert_eq!(Effectiveness::classify(Some(40.0), Some(43.0)), Effectiveness::Neutral);
        assert_eq!(Effectiveness::classify(Some(40.0), Some(30.0)), Effectiveness::Low);
        assert_eq!(Effectiveness::classify(None, Some(30.0)), Effectiveness::Neutral);
        assert_eq!(Effectiveness::classify(Some(40.0), None), Effectiveness::Neutral);
    }

    #[test]
    fn test_boundaries_are_exclusive() {
        assert_eq!(Effectiveness::classify(Some(0.0), Some(10.0)), Effectiveness::Medium);
        assert_eq!(Effectiveness::classify(Some(0.0), Some(5.0)), Effectiveness::Neutral);
        assert_eq!(Effectiveness::classify(Some(0.0), Some(-5.0)), Effectiveness::Neutral);
    }

    #[test]
    fn test_catalog() {
        let exercises = available_exercises();
        assert_eq!(exercises.len(), 2);
        assert_eq!(exercises[0].kind.as_str(), "breathing");
        assert!(exercises.iter().all(|e| !e.instructions.is_empty()));
    }
}
