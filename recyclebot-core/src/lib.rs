//! # Recycle Bot Core
//!
//! Shared foundation for the Recycle Bot workspace: layered configuration,
//! error types and atomic persistence helpers.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    DataConfig, DeviceConfig, DeviceKind, ExportConfig, LoggingConfig, ModelConfig, OracleKind,
    ParamSpec, Precision, RecycleConfig, Sampling, SearchConfig, TrainingConfig, config_exists,
    load_config,
};
pub use error::{ConfigError, Result};
