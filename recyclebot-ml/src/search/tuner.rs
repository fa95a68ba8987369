//! Two-phase fine-tuning search: train the head on a frozen backbone, then
//! unfreeze the top of the backbone and continue at a lower learning rate.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use recyclebot_core::persistence::atomic_write_json;
use recyclebot_core::{DataConfig, ModelConfig, OracleKind, SearchConfig, TrainingConfig};

use crate::data::ImageSet;
use crate::device::DeviceSelection;
use crate::error::{MlError, Result};
use crate::model::{Classifier, ClassifierSpec};
use crate::search::bayesian::{BayesianOptimizationOracle, BayesianSettings};
use crate::search::hyperparameters::{FineTuneParams, HyperParameters, HyperValues};
use crate::search::oracle::{Objective, Oracle, OracleState};
use crate::search::random::RandomSearchOracle;
use crate::search::trial::{Trial, TrialStatus};
use crate::training::reproducibility::SeedManager;
use crate::training::{
    CheckpointManager, History, NoOpObserver, OptimizerConfig, Trainer, TrainingObserver,
    callbacks_from_config,
};

/// Builds models for a hyperparameter point.
pub trait HyperModel: Send {
    /// A fresh model with a frozen backbone.
    fn build(&self, hp: &FineTuneParams) -> Result<Classifier>;

    /// Prepare `model` for the fine-tuning phase.
    fn fine_tune(&self, model: &mut Classifier, hp: &FineTuneParams) -> Result<()>;
}

/// MobileNetV2 transfer-learning classifier for the recycling dataset.
#[derive(Debug, Clone)]
pub struct RecycleHyperModel {
    pub num_classes: usize,
    pub input_height: u32,
    pub input_width: u32,
    pub width_multiplier: f64,
    pub pretrained: Option<PathBuf>,
    pub selection: DeviceSelection,
}

impl RecycleHyperModel {
    pub fn new(
        num_classes: usize,
        data: &DataConfig,
        model: &ModelConfig,
        selection: DeviceSelection,
    ) -> Self {
        Self {
            num_classes,
            input_height: data.image_height,
            input_width: data.image_width,
            width_multiplier: model.width_multiplier,
            pretrained: model.pretrained_weights.clone(),
            selection,
        }
    }

    pub fn spec_for(&self, hp: &FineTuneParams) -> ClassifierSpec {
        ClassifierSpec {
            num_classes: self.num_classes,
            input_height: self.input_height,
            input_width: self.input_width,
            width_multiplier: self.width_multiplier,
            dropout: hp.dropout,
        }
    }
}

impl HyperModel for RecycleHyperModel {
    fn build(&self, hp: &FineTuneParams) -> Result<Classifier> {
        let mut model = Classifier::new(
            self.spec_for(hp),
            &self.selection.device,
            self.selection.dtype,
            self.pretrained.as_deref(),
        )?;
        model.freeze_backbone();
        Ok(model)
    }

    fn fine_tune(&self, model: &mut Classifier, hp: &FineTuneParams) -> Result<()> {
        let unfrozen = model.unfreeze_last(hp.num_unfreeze_layers);
        tracing::debug!(
            unfrozen,
            trainable_params = model.trainable_param_count()?,
            "Backbone unfrozen for fine-tuning"
        );
        Ok(())
    }
}

/// Open the project's oracle: fresh when `overwrite` is set or nothing is
/// saved yet, otherwise reloaded from disk.
pub fn open_oracle(config: &SearchConfig) -> Result<Box<dyn Oracle>> {
    let space = HyperParameters::from_specs(config.space.clone())?;
    let dir = config.project_dir();
    if config.overwrite && dir.exists() {
        tracing::info!(dir = %dir.display(), "Overwriting existing search project");
        std::fs::remove_dir_all(&dir)?;
    }
    let resume = OracleState::exists(&dir);
    let seed = config.seed.unwrap_or_else(rand::random::<u64>);
    let state = OracleState::new(
        dir,
        config.max_trials,
        Objective::from_name(&config.objective),
        seed,
    );

    let mut oracle: Box<dyn Oracle> = match config.oracle {
        OracleKind::Random => Box::new(RandomSearchOracle::new(space, state)),
        OracleKind::Bayesian => {
            let mut settings = BayesianSettings::for_space(&space);
            settings.alpha = config.alpha;
            settings.beta = config.beta;
            if let Some(n) = config.num_initial_points {
                settings.num_initial_points = n;
            }
            Box::new(BayesianOptimizationOracle::new(space, state, settings))
        }
    };
    if resume {
        oracle.reload()?;
    }
    Ok(oracle)
}

/// Result of one trial.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub history: History,
    pub score: f64,
}

/// Drives the oracle, training each proposed point in two phases.
pub struct FineTuner<H: HyperModel> {
    hypermodel: H,
    oracle: Box<dyn Oracle>,
    trainer: Trainer,
    training: TrainingConfig,
    checkpoints: CheckpointManager,
    seeds: SeedManager,
    max_consecutive_failed_trials: usize,
    observer: Box<dyn TrainingObserver>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<H: HyperModel> FineTuner<H> {
    pub fn new(
        hypermodel: H,
        oracle: Box<dyn Oracle>,
        trainer: Trainer,
        training: TrainingConfig,
        max_consecutive_failed_trials: usize,
    ) -> Self {
        let checkpoints = CheckpointManager::new(oracle.state().dir());
        let seeds = SeedManager::new(oracle.state().seed);
        Self {
            hypermodel,
            oracle,
            trainer,
            training,
            checkpoints,
            seeds,
            max_consecutive_failed_trials: max_consecutive_failed_trials.max(1),
            observer: Box::new(NoOpObserver),
            cancel: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn TrainingObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.trainer = self.trainer.with_cancel_flag(flag.clone());
        self.cancel = Some(flag);
        self
    }

    pub fn oracle(&self) -> &dyn Oracle {
        self.oracle.as_ref()
    }

    pub fn hypermodel(&self) -> &H {
        &self.hypermodel
    }

    /// Train and score one trial, saving its checkpoint.
    pub fn run_trial(&mut self, trial: &Trial, train: &ImageSet, valid: &ImageSet) -> Result<TrialOutcome> {
        let hp = FineTuneParams::from_values(&trial.hyperparameters)?;
        let seed = self.seeds.get_seed(&format!("trial_{}", trial.trial_id));
        let trainer = self.trainer.clone().with_seed(seed);
        tracing::info!(trial_id = %trial.trial_id, hyperparameters = %trial.hyperparameters, "Starting trial");

        let mut model = self.hypermodel.build(&hp)?;
        let mut callbacks = callbacks_from_config(&self.training);
        let mut history = trainer.fit(
            &model,
            OptimizerConfig::adam(hp.learning_rate),
            train,
            valid,
            0,
            hp.num_epochs,
            &mut callbacks,
            self.observer.as_mut(),
        )?;

        self.hypermodel.fine_tune(&mut model, &hp)?;
        let fine = trainer.fit(
            &model,
            OptimizerConfig::adam(hp.fine_learning_rate),
            train,
            valid,
            hp.num_epochs,
            hp.total_epochs(),
            &mut callbacks,
            self.observer.as_mut(),
        )?;
        history.merge(fine);

        let objective = self.oracle.state().objective.name.clone();
        let score = history.last(&objective).ok_or_else(|| {
            if history.is_empty() {
                MlError::training("no epochs were run")
            } else {
                MlError::training(format!("objective '{objective}' was not recorded"))
            }
        })?;

        let metrics: BTreeMap<String, f64> = ["loss", "accuracy", "val_loss", "val_accuracy"]
            .iter()
            .filter_map(|m| history.last(m).map(|v| (m.to_string(), v)))
            .collect();
        self.oracle.update_trial(&trial.trial_id, &metrics)?;
        self.checkpoints.save(&trial.trial_id, &model, score)?;
        atomic_write_json(
            &self
                .oracle
                .state()
                .dir()
                .join(format!("trial_{}", trial.trial_id))
                .join("history.json"),
            &history,
        )?;

        tracing::info!(trial_id = %trial.trial_id, score, epochs = history.len(), "Trial finished");
        Ok(TrialOutcome { history, score })
    }

    /// Run trials until the oracle stops.
    pub fn search(&mut self, train: &ImageSet, valid: &ImageSet) -> Result<()> {
        let mut consecutive_failures = 0usize;
        loop {
            if self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                return Err(MlError::Cancelled("search interrupted".to_string()));
            }
            let trial = self.oracle.create_trial()?;
            if trial.status == TrialStatus::Stopped {
                break;
            }

            match self.run_trial(&trial, train, valid) {
                Ok(_) => {
                    consecutive_failures = 0;
                    self.oracle
                        .end_trial(&trial.trial_id, TrialStatus::Completed, None)?;
                }
                Err(e) if e.is_cancelled() => {
                    self.oracle.end_trial(
                        &trial.trial_id,
                        TrialStatus::Invalid,
                        Some(e.to_string()),
                    )?;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(trial_id = %trial.trial_id, error = %e, "Trial failed");
                    self.oracle.end_trial(
                        &trial.trial_id,
                        TrialStatus::Failed,
                        Some(e.to_string()),
                    )?;
                    consecutive_failures += 1;
                    if consecutive_failures >= self.max_consecutive_failed_trials {
                        return Err(MlError::search(format!(
                            "{consecutive_failures} consecutive trials failed, last error: {e}"
                        )));
                    }
                }
            }
        }
        tracing::info!(trials = self.oracle.trials().len(), "Search finished");
        Ok(())
    }

    /// Train a single trial at `values` instead of an oracle proposal.
    ///
    /// The trial is recorded in the project like any other and its model is
    /// returned restored from the checkpoint.
    pub fn run_fixed(
        &mut self,
        values: HyperValues,
        train: &ImageSet,
        valid: &ImageSet,
    ) -> Result<(Trial, Classifier)> {
        self.oracle.space().validate(&values)?;
        if self.oracle.state().budget_spent() {
            return Err(MlError::search(format!(
                "project {} has no trials left",
                self.oracle.state().dir().display()
            )));
        }
        let trial = self.oracle.state_mut().add_trial(values)?;
        if let Err(e) = self.run_trial(&trial, train, valid) {
            let status = if e.is_cancelled() {
                TrialStatus::Invalid
            } else {
                TrialStatus::Failed
            };
            self.oracle
                .end_trial(&trial.trial_id, status, Some(e.to_string()))?;
            return Err(e);
        }
        self.oracle
            .end_trial(&trial.trial_id, TrialStatus::Completed, None)?;

        let trial = self
            .oracle
            .state()
            .trial(&trial.trial_id)
            .cloned()
            .ok_or_else(|| MlError::not_found(format!("trial {}", trial.trial_id)))?;
        let hp = FineTuneParams::from_values(&trial.hyperparameters)?;
        let mut model = self.hypermodel.build(&hp)?;
        self.checkpoints.restore(&trial.trial_id, &mut model)?;
        Ok((trial, model))
    }

    pub fn get_best_hyperparameters(&self, n: usize) -> Vec<HyperValues> {
        self.oracle
            .best_trials(n)
            .into_iter()
            .map(|t| t.hyperparameters)
            .collect()
    }

    /// Rebuild the best trials' models from their checkpoints.
    pub fn get_best_models(&self, n: usize) -> Result<Vec<(Trial, Classifier)>> {
        self.oracle
            .best_trials(n)
            .into_iter()
            .map(|trial| {
                let hp = FineTuneParams::from_values(&trial.hyperparameters)?;
                let mut model = self.hypermodel.build(&hp)?;
                self.checkpoints.restore(&trial.trial_id, &mut model)?;
                Ok((trial, model))
            })
            .collect()
    }

    pub fn results_summary(&self, n: usize) -> String {
        results_summary(self.oracle.as_ref(), n)
    }
}

/// Human-readable report of the best `n` trials.
pub fn results_summary(oracle: &dyn Oracle, n: usize) -> String {
    let state = oracle.state();
    let mut out = String::new();
    let _ = writeln!(out, "Results summary");
    let _ = writeln!(out, "Results in {}", state.dir().display());
    let _ = writeln!(out, "Showing {n} best trials");
    let _ = writeln!(
        out,
        "Objective(name=\"{}\", direction=\"{:?}\")",
        state.objective.name, state.objective.direction
    );
    for trial in oracle.best_trials(n) {
        let _ = writeln!(out);
        let _ = writeln!(out, "Trial {} summary", trial.trial_id);
        let _ = writeln!(out, "Hyperparameters:");
        for (name, value) in trial.hyperparameters.iter() {
            let _ = writeln!(out, "{name}: {value}");
        }
        if let Some(score) = trial.score {
            let _ = writeln!(out, "Score: {score}");
        }
    }
    out
}
