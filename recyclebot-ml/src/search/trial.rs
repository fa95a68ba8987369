//! Search trials.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::search::hyperparameters::HyperValues;

/// Trial status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Completed,
    Failed,
    /// Interrupted or otherwise unusable; not a candidate for best trials.
    Invalid,
    /// Returned by an oracle that has nothing left to propose.
    Stopped,
}

impl TrialStatus {
    /// Whether the trial used up part of the trial budget.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Invalid)
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Invalid => "invalid",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One evaluated (or in-flight) point of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: String,
    pub hyperparameters: HyperValues,
    pub status: TrialStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Objective value once the trial has reported it.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    pub fn new(trial_id: impl Into<String>, hyperparameters: HyperValues) -> Self {
        let now = Utc::now();
        Self {
            trial_id: trial_id.into(),
            hyperparameters,
            status: TrialStatus::Running,
            metrics: BTreeMap::new(),
            score: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Placeholder returned when the oracle stops proposing.
    pub fn stopped() -> Self {
        let mut trial = Self::new("", HyperValues::new());
        trial.status = TrialStatus::Stopped;
        trial
    }

    pub fn set_status(&mut self, status: TrialStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Format a trial index the way trial directories are named (`00`, `01`, ...).
pub fn format_trial_id(index: usize, max_trials: usize) -> String {
    let width = max_trials.saturating_sub(1).to_string().len().max(2);
    format!("{index:0width$}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_ids() {
        assert_eq!(format_trial_id(0, 10), "00");
        assert_eq!(format_trial_id(7, 10), "07");
        assert_eq!(format_trial_id(42, 500), "042");
    }

    #[test]
    fn test_status_flags() {
        assert!(TrialStatus::Failed.is_finished());
        assert!(TrialStatus::Invalid.is_finished());
        assert!(!TrialStatus::Running.is_finished());
        assert!(!TrialStatus::Stopped.is_finished());
        assert_eq!(Trial::stopped().status, TrialStatus::Stopped);
    }

    #[test]
    fn test_trial_serde() {
        let mut trial = Trial::new("03", HyperValues::new());
        trial.metrics.insert("val_accuracy".into(), 0.75);
        trial.set_status(TrialStatus::Completed);
        let json = serde_json::to_string(&trial).unwrap();
        assert!(json.contains("\"completed\""));
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trial);
    }
}
