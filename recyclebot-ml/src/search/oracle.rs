//! Oracle state shared by every search algorithm, and the `Oracle` trait.
//!
//! State is persisted under the project directory as `oracle.json` plus one
//! `trial_<id>/trial.json` per trial, so an interrupted search can resume.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use recyclebot_core::persistence::{atomic_write_json, load_json};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::search::hyperparameters::{HyperParameters, HyperValues};
use crate::search::trial::{Trial, TrialStatus, format_trial_id};

/// Consecutive duplicate proposals tolerated before the oracle gives up.
pub const MAX_COLLISIONS: usize = 20;

const ORACLE_FILE: &str = "oracle.json";
const TRIAL_FILE: &str = "trial.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Max,
    Min,
}

/// The metric a search optimises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub direction: Direction,
}

impl Objective {
    /// Losses are minimised, everything else maximised.
    pub fn from_name(name: &str) -> Self {
        let direction = if name.contains("loss") {
            Direction::Min
        } else {
            Direction::Max
        };
        Self {
            name: name.to_string(),
            direction,
        }
    }

    /// Score mapped so that larger is always better.
    pub fn oriented(&self, score: f64) -> f64 {
        match self.direction {
            Direction::Max => score,
            Direction::Min => -score,
        }
    }

    pub fn is_better(&self, a: f64, b: f64) -> bool {
        self.oriented(a) > self.oriented(b)
    }
}

/// Bookkeeping common to all oracles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleState {
    pub max_trials: usize,
    pub objective: Objective,
    pub seed: u64,
    /// Trial ids in creation order.
    pub trial_order: Vec<String>,
    /// Fingerprints of every proposed point.
    pub tried: BTreeSet<String>,
    /// Number of random streams handed out so far.
    pub rng_draws: u64,
    #[serde(skip)]
    trials: HashMap<String, Trial>,
    #[serde(skip)]
    requeued: VecDeque<String>,
    #[serde(skip)]
    dir: PathBuf,
}

impl OracleState {
    pub fn new(dir: impl Into<PathBuf>, max_trials: usize, objective: Objective, seed: u64) -> Self {
        Self {
            max_trials,
            objective,
            seed,
            trial_order: Vec::new(),
            tried: BTreeSet::new(),
            rng_draws: 0,
            trials: HashMap::new(),
            requeued: VecDeque::new(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a saved oracle exists in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(ORACLE_FILE).exists()
    }

    /// A fresh random stream; successive calls (also across resumes) differ.
    pub fn next_rng(&mut self) -> ChaCha8Rng {
        let rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.rng_draws));
        self.rng_draws += 1;
        rng
    }

    pub fn trial(&self, trial_id: &str) -> Option<&Trial> {
        self.trials.get(trial_id)
    }

    /// All trials in creation order.
    pub fn trials(&self) -> Vec<&Trial> {
        self.trial_order
            .iter()
            .filter_map(|id| self.trials.get(id))
            .collect()
    }

    pub fn num_trials(&self) -> usize {
        self.trial_order.len()
    }

    pub fn requeued(&self) -> usize {
        self.requeued.len()
    }

    /// Completed trials that reported the objective.
    pub fn completed(&self) -> Vec<&Trial> {
        self.trials()
            .into_iter()
            .filter(|t| t.status == TrialStatus::Completed && t.score.is_some())
            .collect()
    }

    /// Completed trials encoded in the unit cube with their oriented scores.
    pub fn observations(&self, space: &HyperParameters) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for trial in self.completed() {
            if let Some(score) = trial.score.filter(|s| s.is_finite()) {
                xs.push(space.to_unit(&trial.hyperparameters)?);
                ys.push(self.objective.oriented(score));
            }
        }
        Ok((xs, ys))
    }

    /// Best completed trials, best first.
    pub fn best_trials(&self, n: usize) -> Vec<Trial> {
        let mut completed: Vec<&Trial> = self.completed();
        completed.sort_by(|a, b| {
            let (sa, sb) = (
                self.objective.oriented(a.score.unwrap_or(f64::NEG_INFINITY)),
                self.objective.oriented(b.score.unwrap_or(f64::NEG_INFINITY)),
            );
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        completed.into_iter().take(n).cloned().collect()
    }

    /// Register a new running trial for `values`.
    pub fn add_trial(&mut self, values: HyperValues) -> Result<Trial> {
        let id = format_trial_id(self.trial_order.len(), self.max_trials);
        self.tried.insert(values.fingerprint());
        let trial = Trial::new(id.clone(), values);
        self.trial_order.push(id.clone());
        self.trials.insert(id, trial.clone());
        self.save_trial(&trial)?;
        self.save()?;
        Ok(trial)
    }

    fn trial_mut(&mut self, trial_id: &str) -> Result<&mut Trial> {
        self.trials
            .get_mut(trial_id)
            .ok_or_else(|| MlError::not_found(format!("trial {trial_id}")))
    }

    /// Record metrics for a trial; the objective metric becomes its score.
    pub fn update_trial(&mut self, trial_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let objective = self.objective.name.clone();
        let trial = self.trial_mut(trial_id)?;
        for (name, value) in metrics {
            trial.metrics.insert(name.clone(), *value);
        }
        if let Some(score) = metrics.get(&objective) {
            trial.score = Some(*score);
        }
        trial.updated_at = chrono::Utc::now();
        let trial = trial.clone();
        self.save_trial(&trial)
    }

    pub fn end_trial(&mut self, trial_id: &str, status: TrialStatus, message: Option<String>) -> Result<()> {
        let trial = self.trial_mut(trial_id)?;
        trial.set_status(status);
        trial.message = message;
        let trial = trial.clone();
        self.save_trial(&trial)?;
        self.save()
    }

    /// Pop a trial re-queued by [`OracleState::reload`] and mark it running again.
    pub fn take_requeued(&mut self) -> Result<Option<Trial>> {
        let Some(id) = self.requeued.pop_front() else {
            return Ok(None);
        };
        let trial = self.trial_mut(&id)?;
        trial.set_status(TrialStatus::Running);
        trial.metrics.clear();
        trial.score = None;
        trial.message = None;
        let trial = trial.clone();
        self.save_trial(&trial)?;
        tracing::info!(trial_id = %id, "Re-running interrupted trial");
        Ok(Some(trial))
    }

    /// Whether every trial of the budget has been created.
    pub fn budget_spent(&self) -> bool {
        self.trial_order.len() >= self.max_trials
    }

    pub fn is_tried(&self, values: &HyperValues) -> bool {
        self.tried.contains(&values.fingerprint())
    }

    fn trial_path(&self, trial_id: &str) -> PathBuf {
        self.dir.join(format!("trial_{trial_id}")).join(TRIAL_FILE)
    }

    fn save_trial(&self, trial: &Trial) -> Result<()> {
        atomic_write_json(&self.trial_path(&trial.trial_id), trial)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        atomic_write_json(&self.dir.join(ORACLE_FILE), self)?;
        Ok(())
    }

    /// Restore trials from disk, keeping this state's budget and objective.
    ///
    /// Trials left `Running` by an interrupted session are queued to run again.
    pub fn reload(&mut self) -> Result<()> {
        let saved: OracleState = load_json(&self.dir.join(ORACLE_FILE))?.ok_or_else(|| {
            MlError::not_found(format!("oracle state in {}", self.dir.display()))
        })?;
        if saved.objective.name != self.objective.name {
            tracing::warn!(
                saved = %saved.objective.name,
                configured = %self.objective.name,
                "Objective changed since the project was created"
            );
        }

        self.trials.clear();
        self.requeued.clear();
        for id in &saved.trial_order {
            let trial: Trial = load_json(&self.trial_path(id))?
                .ok_or_else(|| MlError::not_found(format!("record for trial {id}")))?;
            if trial.status == TrialStatus::Running {
                self.requeued.push_back(id.clone());
            }
            self.trials.insert(id.clone(), trial);
        }
        self.trial_order = saved.trial_order;
        self.tried = saved.tried;
        self.rng_draws = saved.rng_draws;
        self.seed = saved.seed;
        tracing::info!(
            trials = self.trial_order.len(),
            requeued = self.requeued.len(),
            "Reloaded search project"
        );
        Ok(())
    }
}

/// A search algorithm proposing hyperparameter points.
pub trait Oracle: Send {
    fn name(&self) -> &'static str;

    fn space(&self) -> &HyperParameters;

    fn state(&self) -> &OracleState;

    fn state_mut(&mut self) -> &mut OracleState;

    /// Propose the next point, or `None` when nothing is left to try.
    fn populate_space(&mut self) -> Result<Option<HyperValues>>;

    /// Next trial to run: a re-queued one first, then a fresh proposal.
    ///
    /// Returns a `Stopped` trial once the budget is spent, the space is
    /// exhausted, or more than [`MAX_COLLISIONS`] proposals in a row were
    /// already tried.
    fn create_trial(&mut self) -> Result<Trial> {
        if let Some(trial) = self.state_mut().take_requeued()? {
            return Ok(trial);
        }
        if self.state().budget_spent() {
            return Ok(Trial::stopped());
        }
        let mut collisions = 0usize;
        loop {
            let Some(values) = self.populate_space()? else {
                tracing::info!("Search space exhausted");
                return Ok(Trial::stopped());
            };
            if !self.state().is_tried(&values) {
                let trial = self.state_mut().add_trial(values)?;
                tracing::debug!(oracle = self.name(), trial_id = %trial.trial_id, "Created trial");
                return Ok(trial);
            }
            collisions += 1;
            if collisions > MAX_COLLISIONS {
                tracing::info!(collisions, "Oracle keeps proposing tried values, stopping");
                return Ok(Trial::stopped());
            }
        }
    }

    fn update_trial(&mut self, trial_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        self.state_mut().update_trial(trial_id, metrics)
    }

    fn end_trial(&mut self, trial_id: &str, status: TrialStatus, message: Option<String>) -> Result<()> {
        self.state_mut().end_trial(trial_id, status, message)
    }

    fn best_trials(&self, n: usize) -> Vec<Trial> {
        self.state().best_trials(n)
    }

    fn trials(&self) -> Vec<Trial> {
        self.state().trials().into_iter().cloned().collect()
    }

    fn save(&self) -> Result<()> {
        self.state().save()
    }

    fn reload(&mut self) -> Result<()> {
        self.state_mut().reload()
    }
}
