//! Training infrastructure: fit loop, callbacks, history, checkpoints.

pub mod callbacks;
pub mod checkpoint;
pub mod metrics;
pub mod reproducibility;
pub mod trainer;

pub use callbacks::{
    CallbackAction, EarlyStoppingCallback, TerminateOnNan, TrainingCallback, callbacks_from_config,
};
pub use checkpoint::{Checkpoint, CheckpointManager, file_sha256};
pub use metrics::{EpochLogs, History};
pub use reproducibility::EnvironmentSnapshot;
pub use trainer::{NoOpObserver, OptimizerConfig, Trainer, TrainingObserver};
