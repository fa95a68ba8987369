//! Hyperparameter search: space, trials, oracles and the fine-tuning tuner.

pub mod bayesian;
pub mod gaussian_process;
pub mod hyperparameters;
pub mod oracle;
pub mod random;
pub mod trial;
pub mod tuner;

pub use bayesian::{BayesianOptimizationOracle, BayesianSettings};
pub use hyperparameters::{FineTuneParams, HpValue, HyperParameters, HyperValues, UnitEncoding};
pub use oracle::{Direction, Objective, Oracle, OracleState};
pub use random::RandomSearchOracle;
pub use trial::{Trial, TrialStatus};
pub use tuner::{FineTuner, HyperModel, RecycleHyperModel, TrialOutcome, open_oracle, results_summary};
