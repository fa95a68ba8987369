//! Training callbacks: early stopping and NaN termination.

use recyclebot_core::TrainingConfig;
use serde::{Deserialize, Serialize};

use crate::training::metrics::EpochLogs;

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send {
    /// Called at the end of each epoch with the epoch's metrics.
    fn on_epoch_end(&mut self, logs: &EpochLogs) -> CallbackAction;

    /// Called before a `fit` starts so state from an earlier phase is cleared.
    fn on_train_begin(&mut self) {}
}

/// Stops a `fit` once `val_loss` has not improved by more than `min_delta`
/// for `patience` consecutive epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingCallback {
    pub patience: usize,
    pub min_delta: f64,
    #[serde(skip)]
    wait: usize,
    #[serde(skip)]
    best: Option<(usize, f64)>,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            wait: 0,
            best: None,
        }
    }

    /// Epoch and value of the best `val_loss` seen in this `fit`.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best
    }
}

impl TrainingCallback for EarlyStoppingCallback {
    fn on_epoch_end(&mut self, logs: &EpochLogs) -> CallbackAction {
        let improved = self
            .best
            .is_none_or(|(_, best)| logs.val_loss < best - self.min_delta);
        if improved {
            self.best = Some((logs.epoch, logs.val_loss));
            self.wait = 0;
            return CallbackAction::Continue;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return CallbackAction::Continue;
        }
        tracing::info!(
            epoch = logs.epoch,
            best_epoch = self.best.map(|(epoch, _)| epoch),
            patience = self.patience,
            "Early stopping"
        );
        CallbackAction::Stop
    }

    fn on_train_begin(&mut self) {
        self.wait = 0;
        self.best = None;
    }
}

/// Stops training as soon as the loss becomes NaN or infinite.
#[derive(Debug, Clone, Default)]
pub struct TerminateOnNan;

impl TrainingCallback for TerminateOnNan {
    fn on_epoch_end(&mut self, logs: &EpochLogs) -> CallbackAction {
        if logs.loss.is_finite() {
            CallbackAction::Continue
        } else {
            tracing::warn!(epoch = logs.epoch, "Invalid loss, terminating training");
            CallbackAction::Stop
        }
    }
}

/// Callbacks described by the training configuration.
pub fn callbacks_from_config(config: &TrainingConfig) -> Vec<Box<dyn TrainingCallback>> {
    let mut callbacks: Vec<Box<dyn TrainingCallback>> = Vec::new();
    if config.terminate_on_nan {
        callbacks.push(Box::new(TerminateOnNan));
    }
    if let Some(es) = &config.early_stopping {
        callbacks.push(Box::new(EarlyStoppingCallback::new(es.patience, es.min_delta)));
    }
    callbacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use recyclebot_core::config::EarlyStoppingConfig;

    fn logs(loss: f64, val_loss: f64) -> EpochLogs {
        EpochLogs {
            epoch: 1,
            loss,
            accuracy: 0.0,
            val_loss,
            val_accuracy: 0.0,
        }
    }

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStoppingCallback::new(3, 0.01);
        assert_eq!(cb.on_epoch_end(&logs(1.0, 0.5)), CallbackAction::Continue);
        assert_eq!(cb.on_epoch_end(&logs(1.0, 0.4)), CallbackAction::Continue);
        // within min_delta of the best: no improvement
        assert_eq!(cb.on_epoch_end(&logs(1.0, 0.395)), CallbackAction::Continue);
        assert_eq!(cb.on_epoch_end(&logs(1.0, 0.4)), CallbackAction::Continue);
        assert_eq!(cb.on_epoch_end(&logs(1.0, 0.4)), CallbackAction::Stop);
        assert_eq!(cb.best(), Some((1, 0.4)));

        cb.on_train_begin();
        assert_eq!(cb.best(), None);
        assert_eq!(cb.on_epoch_end(&logs(1.0, 0.9)), CallbackAction::Continue);
    }

    #[test]
    fn test_terminate_on_nan() {
        let mut cb = TerminateOnNan;
        assert_eq!(cb.on_epoch_end(&logs(0.3, 0.3)), CallbackAction::Continue);
        assert_eq!(cb.on_epoch_end(&logs(f64::NAN, 0.3)), CallbackAction::Stop);
        assert_eq!(cb.on_epoch_end(&logs(f64::INFINITY, 0.3)), CallbackAction::Stop);
    }

    #[test]
    fn test_callbacks_from_config() {
        let config = TrainingConfig {
            terminate_on_nan: true,
            early_stopping: Some(EarlyStoppingConfig {
                patience: 2,
                min_delta: 0.0,
            }),
        };
        assert_eq!(callbacks_from_config(&config).len(), 2);
        assert!(callbacks_from_config(&TrainingConfig {
            terminate_on_nan: false,
            early_stopping: None,
        })
        .is_empty());
    }
}
