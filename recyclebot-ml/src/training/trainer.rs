//! Epoch loop: Adam over the trainable variables, validation after each epoch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use candle_core::{D, DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use recyclebot_core::config::AugmentConfig;

use crate::data::{ImageSet, batch_indices, make_batch, smoothed_one_hot};
use crate::error::{MlError, Result};
use crate::model::Classifier;
use crate::training::callbacks::{CallbackAction, TrainingCallback};
use crate::training::metrics::{EpochLogs, History};

/// Adam settings for one `fit` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl OptimizerConfig {
    /// Adam with Keras defaults and no weight decay.
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
        }
    }

    fn params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        }
    }
}

/// Progress hooks, called from the training thread.
pub trait TrainingObserver: Send {
    fn on_epoch_begin(&mut self, _epoch: usize, _epochs: usize, _num_batches: usize) {}
    fn on_batch_end(&mut self, _batch: usize, _loss: f64) {}
    fn on_epoch_end(&mut self, _logs: &EpochLogs) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl TrainingObserver for NoOpObserver {}

/// Categorical cross-entropy against (smoothed) one-hot targets.
pub fn smoothed_cross_entropy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    (targets * log_probs)?.sum(D::Minus1)?.neg()?.mean_all()
}

/// Number of rows whose arg-max matches the label.
pub fn correct_predictions(logits: &Tensor, labels: &Tensor) -> candle_core::Result<usize> {
    let hits = logits
        .argmax(D::Minus1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits.round() as usize)
}

/// Runs Keras-style `fit` calls over in-memory image sets.
#[derive(Debug, Clone)]
pub struct Trainer {
    pub batch_size: usize,
    pub label_smoothing: f64,
    pub augment: AugmentConfig,
    pub seed: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl Trainer {
    pub fn new(batch_size: usize, label_smoothing: f64, augment: AugmentConfig, seed: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            label_smoothing,
            augment,
            seed,
            cancel: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Abort training with [`MlError::Cancelled`] once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                Err(MlError::Cancelled("training interrupted".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Train epochs `initial_epoch..epochs`, validating after each one.
    ///
    /// A callback returning [`CallbackAction::Stop`] ends this call after the
    /// epoch that triggered it.
    #[allow(clippy::too_many_arguments)]
    pub fn fit(
        &self,
        model: &Classifier,
        optimizer: OptimizerConfig,
        train: &ImageSet,
        valid: &ImageSet,
        initial_epoch: usize,
        epochs: usize,
        callbacks: &mut [Box<dyn TrainingCallback>],
        observer: &mut dyn TrainingObserver,
    ) -> Result<History> {
        if train.is_empty() {
            return Err(MlError::training("training set is empty"));
        }
        if valid.is_empty() {
            return Err(MlError::training("validation set is empty"));
        }
        let num_classes = model.spec().num_classes;
        if train.num_classes() != num_classes || valid.num_classes() != num_classes {
            return Err(MlError::training(format!(
                "model has {num_classes} classes but data has {}",
                train.num_classes()
            )));
        }

        let mut history = History::default();
        if epochs <= initial_epoch {
            return Ok(history);
        }

        let vars = model.trainable_vars()?;
        tracing::debug!(
            vars = vars.len(),
            unfrozen_layers = model.unfrozen_layers(),
            lr = optimizer.learning_rate,
            "Starting fit"
        );
        let mut opt = AdamW::new(vars, optimizer.params())?;
        for cb in callbacks.iter_mut() {
            cb.on_train_begin();
        }

        let started = Instant::now();
        for epoch in initial_epoch..epochs {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            let batches = batch_indices(train.len(), self.batch_size, Some(&mut rng));
            observer.on_epoch_begin(epoch, epochs, batches.len());

            let mut loss_sum = 0.0f64;
            let mut correct = 0usize;
            for (i, indices) in batches.iter().enumerate() {
                self.check_cancelled()?;
                let batch = make_batch(
                    train,
                    indices,
                    Some((&self.augment, &mut rng)),
                    model.device(),
                    model.dtype(),
                )?;
                let targets = Tensor::from_vec(
                    smoothed_one_hot(&batch.label_values, num_classes, self.label_smoothing),
                    (batch.len(), num_classes),
                    model.device(),
                )?;
                let logits = model.forward_t(&batch.images, true)?;
                let loss = smoothed_cross_entropy(&logits, &targets)?;
                opt.backward_step(&loss)?;

                let batch_loss = loss.to_scalar::<f32>()? as f64;
                loss_sum += batch_loss * batch.len() as f64;
                correct += correct_predictions(&logits, &batch.labels)?;
                observer.on_batch_end(i, batch_loss);
            }

            let (val_loss, val_accuracy) = self.evaluate(model, valid)?;
            let logs = EpochLogs {
                epoch,
                loss: loss_sum / train.len() as f64,
                accuracy: correct as f64 / train.len() as f64,
                val_loss,
                val_accuracy,
            };
            tracing::info!(
                epoch,
                loss = logs.loss,
                accuracy = logs.accuracy,
                val_loss = logs.val_loss,
                val_accuracy = logs.val_accuracy,
                "Epoch finished"
            );
            history.record_epoch(logs);
            observer.on_epoch_end(&logs);

            let mut stop = false;
            for cb in callbacks.iter_mut() {
                if cb.on_epoch_end(&logs) == CallbackAction::Stop {
                    stop = true;
                }
            }
            if stop {
                break;
            }
        }
        history.total_training_time_secs = started.elapsed().as_secs_f64();
        Ok(history)
    }

    /// Mean loss and accuracy over `set`, in inference mode.
    pub fn evaluate(&self, model: &Classifier, set: &ImageSet) -> Result<(f64, f64)> {
        if set.is_empty() {
            return Err(MlError::training("cannot evaluate an empty set"));
        }
        let num_classes = model.spec().num_classes;
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        for indices in batch_indices(set.len(), self.batch_size, None) {
            self.check_cancelled()?;
            let batch = make_batch(set, &indices, None, model.device(), model.dtype())?;
            let targets = Tensor::from_vec(
                smoothed_one_hot(&batch.label_values, num_classes, self.label_smoothing),
                (batch.len(), num_classes),
                model.device(),
            )?;
            let logits = model.forward_t(&batch.images, false)?;
            let loss = smoothed_cross_entropy(&logits, &targets)?.to_scalar::<f32>()? as f64;
            loss_sum += loss * batch.len() as f64;
            correct += correct_predictions(&logits, &batch.labels)?;
        }
        Ok((loss_sum / set.len() as f64, correct as f64 / set.len() as f64))
    }
}
