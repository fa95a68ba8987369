//! Per-epoch training history.

use serde::{Deserialize, Serialize};

/// Metrics logged at the end of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    /// Zero-based global epoch index (continues across fine-tuning).
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

impl EpochLogs {
    /// Look up a metric by its Keras-style name.
    pub fn get(&self, metric: &str) -> Option<f64> {
        match metric {
            "loss" => Some(self.loss),
            "accuracy" => Some(self.accuracy),
            "val_loss" => Some(self.val_loss),
            "val_accuracy" => Some(self.val_accuracy),
            _ => None,
        }
    }
}

/// Epoch-by-epoch record of a `fit` call, or of several merged phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochLogs>,
    pub total_training_time_secs: f64,
}

impl History {
    pub fn record_epoch(&mut self, logs: EpochLogs) {
        self.epochs.push(logs);
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    /// Value of `metric` at the final recorded epoch.
    pub fn last(&self, metric: &str) -> Option<f64> {
        self.epochs.last().and_then(|e| e.get(metric))
    }

    /// Append another phase's epochs.
    pub fn merge(&mut self, other: History) {
        self.epochs.extend(other.epochs);
        self.total_training_time_secs += other.total_training_time_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(epoch: usize, val_accuracy: f64) -> EpochLogs {
        EpochLogs {
            epoch,
            loss: 1.0 / (epoch + 1) as f64,
            accuracy: 0.5,
            val_loss: 0.9,
            val_accuracy,
        }
    }

    #[test]
    fn test_history_last() {
        let mut history = History::default();
        assert_eq!(history.last("val_accuracy"), None);
        history.record_epoch(logs(0, 0.4));
        history.record_epoch(logs(1, 0.7));
        history.record_epoch(logs(2, 0.6));
        assert_eq!(history.last("val_accuracy"), Some(0.6));
        assert_eq!(history.last("f1"), None);
    }

    #[test]
    fn test_merge_phases() {
        let mut head = History::default();
        head.record_epoch(logs(0, 0.4));
        head.total_training_time_secs = 2.0;
        let mut fine = History::default();
        fine.record_epoch(logs(1, 0.8));
        fine.total_training_time_secs = 3.0;

        head.merge(fine);
        assert_eq!(head.len(), 2);
        assert_eq!(head.last("val_accuracy"), Some(0.8));
        assert_eq!(head.total_training_time_secs, 5.0);
    }
}
