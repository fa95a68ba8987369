//! Terminal progress bars for training epochs.

use indicatif::{ProgressBar, ProgressStyle};
use recyclebot_ml::training::{EpochLogs, TrainingObserver};

const BATCH_TEMPLATE: &str =
    " [epoch {prefix}] {elapsed_precise} |{bar:40.cyan/blue}| {pos}/{len} batches, eta {eta} {wide_msg}";

/// One bar per epoch, finished with the epoch's metrics.
pub struct ProgressObserver {
    hidden: bool,
    bar: Option<ProgressBar>,
}

impl ProgressObserver {
    pub fn new(hidden: bool) -> Self {
        Self { hidden, bar: None }
    }
}

fn batch_style() -> ProgressStyle {
    ProgressStyle::with_template(BATCH_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

pub fn epoch_summary(logs: &EpochLogs) -> String {
    format!(
        "loss {:.4}, accuracy {:.4}, val_loss {:.4}, val_accuracy {:.4}",
        logs.loss, logs.accuracy, logs.val_loss, logs.val_accuracy
    )
}

impl TrainingObserver for ProgressObserver {
    fn on_epoch_begin(&mut self, epoch: usize, epochs: usize, num_batches: usize) {
        let bar = if self.hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(num_batches as u64)
        };
        bar.set_style(batch_style());
        bar.set_prefix(format!("{}/{}", epoch + 1, epochs));
        self.bar = Some(bar);
    }

    fn on_batch_end(&mut self, _batch: usize, loss: f64) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!("loss {loss:.4}"));
        }
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(epoch_summary(logs));
        }
        tracing::debug!(
            epoch = logs.epoch,
            loss = logs.loss,
            val_loss = logs.val_loss,
            val_accuracy = logs.val_accuracy,
            "Epoch finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs() -> EpochLogs {
        EpochLogs {
            epoch: 2,
            loss: 0.51234,
            accuracy: 0.8,
            val_loss: 0.6,
            val_accuracy: 0.75,
        }
    }

    #[test]
    fn test_epoch_summary() {
        assert_eq!(
            epoch_summary(&logs()),
            "loss 0.5123, accuracy 0.8000, val_loss 0.6000, val_accuracy 0.7500"
        );
    }

    #[test]
    fn test_hidden_observer_tracks_bar_lifecycle() {
        let mut observer = ProgressObserver::new(true);
        observer.on_epoch_begin(2, 5, 4);
        observer.on_batch_end(0, 0.7);
        assert_eq!(observer.bar.as_ref().map(|b| b.position()), Some(1));
        observer.on_epoch_end(&logs());
        assert!(observer.bar.is_none());
    }
}
