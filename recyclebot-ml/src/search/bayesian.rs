//! Bayesian optimization with a Gaussian-process surrogate and an upper
//! confidence bound acquisition.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::search::gaussian_process::GaussianProcess;
use crate::search::hyperparameters::{HyperParameters, HyperValues};
use crate::search::oracle::{Oracle, OracleState};

const RANDOM_CANDIDATES: usize = 1000;
const REFINED_STARTS: usize = 5;
const REFINE_STEPS: usize = 50;

/// Tuning knobs of [`BayesianOptimizationOracle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BayesianSettings {
    /// Random trials before the surrogate takes over.
    pub num_initial_points: usize,
    /// Observation noise added to the kernel diagonal.
    pub alpha: f64,
    /// Exploration weight of the acquisition.
    pub beta: f64,
}

impl BayesianSettings {
    /// Defaults: three random points per dimension, `alpha = 1e-4`, `beta = 2.6`.
    pub fn for_space(space: &HyperParameters) -> Self {
        Self {
            num_initial_points: 3 * space.dims(),
            alpha: 1e-4,
            beta: 2.6,
        }
    }
}

pub struct BayesianOptimizationOracle {
    space: HyperParameters,
    state: OracleState,
    settings: BayesianSettings,
}

impl BayesianOptimizationOracle {
    pub fn new(space: HyperParameters, state: OracleState, settings: BayesianSettings) -> Self {
        Self {
            space,
            state,
            settings,
        }
    }

    pub fn settings(&self) -> &BayesianSettings {
        &self.settings
    }

    fn acquisition(&self, gp: &GaussianProcess, x: &[f64]) -> f64 {
        let (mu, sigma) = gp.predict(x);
        mu + self.settings.beta * sigma
    }

    /// Best acquisition point among random candidates, then hill-climbed
    /// from the top few with shrinking perturbations.
    fn maximize_acquisition(&self, gp: &GaussianProcess, rng: &mut ChaCha8Rng) -> Vec<f64> {
        let dims = self.space.dims();
        let mut scored: Vec<(f64, Vec<f64>)> = (0..RANDOM_CANDIDATES)
            .map(|_| {
                let x: Vec<f64> = (0..dims).map(|_| rng.gen_range(0.0..1.0)).collect();
                (self.acquisition(gp, &x), x)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(REFINED_STARTS);

        let mut best = scored[0].clone();
        for (mut value, mut x) in scored {
            let mut step = 0.1;
            for _ in 0..REFINE_STEPS {
                let candidate: Vec<f64> = x
                    .iter()
                    .map(|v| (v + rng.gen_range(-step..step)).clamp(0.0, 1.0))
                    .collect();
                let candidate_value = self.acquisition(gp, &candidate);
                if candidate_value > value {
                    value = candidate_value;
                    x = candidate;
                } else {
                    step = (step * 0.9f64).max(1e-3);
                }
            }
            if value > best.0 {
                best = (value, x);
            }
        }
        best.1
    }
}

impl Oracle for BayesianOptimizationOracle {
    fn name(&self) -> &'static str {
        "bayesian"
    }

    fn space(&self) -> &HyperParameters {
        &self.space
    }

    fn state(&self) -> &OracleState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OracleState {
        &mut self.state
    }

    fn populate_space(&mut self) -> Result<Option<HyperValues>> {
        let mut rng = self.state.next_rng();
        let (xs, ys) = self.state.observations(&self.space)?;
        if xs.len() < self.settings.num_initial_points.max(1) {
            return Ok(Some(self.space.sample(&mut rng)));
        }
        let gp = match GaussianProcess::fit(&xs, &ys, self.settings.alpha) {
            Ok(gp) => gp,
            Err(e) => {
                tracing::warn!(error = %e, "Surrogate fit failed, sampling randomly");
                return Ok(Some(self.space.sample(&mut rng)));
            }
        };
        tracing::debug!(
            observations = xs.len(),
            length_scale = gp.length_scale(),
            "Fitted surrogate"
        );
        let point = self.maximize_acquisition(&gp, &mut rng);
        Ok(Some(self.space.from_unit(&point)?))
    }
}
