//! Configuration system for Recycle Bot.
//!
//! Uses `figment` for layered configuration: defaults -> user file -> workspace
//! file -> explicit file -> environment -> CLI overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecycleConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which accelerator to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Numeric precision policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    F32,
    #[default]
    MixedF16,
    MixedBf16,
}

/// Device and precision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub kind: DeviceKind,
    /// Accelerator ordinal.
    #[serde(default)]
    pub ordinal: usize,
    #[serde(default)]
    pub precision: Precision,
    /// Seed for the accelerator RNG (dropout masks).
    #[serde(default)]
    pub seed: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Auto,
            ordinal: 0,
            precision: Precision::MixedF16,
            seed: 0,
        }
    }
}

/// Dataset loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory with one sub-directory per class.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_image_height")]
    pub image_height: u32,
    #[serde(default = "default_image_width")]
    pub image_width: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of samples held out for validation.
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    /// Seed for the train/validation shuffle and per-epoch batch order.
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub augment: AugmentConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            image_height: default_image_height(),
            image_width: default_image_width(),
            batch_size: default_batch_size(),
            validation_split: default_validation_split(),
            seed: 0,
            extensions: default_extensions(),
            augment: AugmentConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_image_height() -> u32 {
    512
}

fn default_image_width() -> u32 {
    384
}

fn default_batch_size() -> usize {
    64
}

fn default_validation_split() -> f64 {
    0.1
}

fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Training-time augmentation applied to cached images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AugmentConfig {
    #[serde(default)]
    pub horizontal_flip: bool,
    #[serde(default)]
    pub vertical_flip: bool,
}

/// Model architecture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Safetensors file with ImageNet backbone weights.
    #[serde(default)]
    pub pretrained_weights: Option<PathBuf>,
    /// Number of output classes; inferred from the dataset when unset.
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(default = "default_width_multiplier")]
    pub width_multiplier: f64,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            pretrained_weights: None,
            num_classes: None,
            width_multiplier: default_width_multiplier(),
            label_smoothing: default_label_smoothing(),
        }
    }
}

fn default_width_multiplier() -> f64 {
    1.0
}

fn default_label_smoothing() -> f64 {
    0.1
}

/// Callbacks applied during every `fit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_true")]
    pub terminate_on_nan: bool,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            terminate_on_nan: true,
            early_stopping: None,
        }
    }
}

/// Early stopping on validation loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
}

fn default_true() -> bool {
    true
}

/// Search oracle selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    #[default]
    Bayesian,
    Random,
}

/// How a float hyperparameter is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    #[default]
    Linear,
    Log,
}

/// One entry of the hyperparameter search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpec {
    Float {
        name: String,
        min: f64,
        max: f64,
        #[serde(default)]
        sampling: Sampling,
    },
    Int {
        name: String,
        min: i64,
        max: i64,
    },
}

impl ParamSpec {
    pub fn float(name: &str, min: f64, max: f64, sampling: Sampling) -> Self {
        Self::Float {
            name: name.to_string(),
            min,
            max,
            sampling,
        }
    }

    pub fn int(name: &str, min: i64, max: i64) -> Self {
        Self::Int {
            name: name.to_string(),
            min,
            max,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Float { name, .. } | Self::Int { name, .. } => name,
        }
    }
}

/// Hyperparameter search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub oracle: OracleKind,
    /// Metric the oracle maximizes.
    #[serde(default = "default_objective")]
    pub objective: String,
    #[serde(default = "default_max_trials")]
    pub max_trials: usize,
    /// Random trials before the surrogate takes over; defaults to 3 per dimension.
    #[serde(default)]
    pub num_initial_points: Option<usize>,
    /// Observation noise added to the surrogate's kernel diagonal.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Exploration weight of the upper confidence bound.
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_max_consecutive_failed")]
    pub max_consecutive_failed_trials: usize,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Discard an existing project instead of resuming it.
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_space")]
    pub space: Vec<ParamSpec>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            oracle: OracleKind::Bayesian,
            objective: default_objective(),
            max_trials: default_max_trials(),
            num_initial_points: None,
            alpha: default_alpha(),
            beta: default_beta(),
            seed: None,
            max_consecutive_failed_trials: default_max_consecutive_failed(),
            directory: default_directory(),
            project_name: default_project_name(),
            overwrite: false,
            space: default_space(),
        }
    }
}

impl SearchConfig {
    /// Directory holding oracle state, trial records and checkpoints.
    pub fn project_dir(&self) -> PathBuf {
        self.directory.join(&self.project_name)
    }
}

fn default_objective() -> String {
    "val_accuracy".to_string()
}

fn default_max_trials() -> usize {
    10
}

fn default_alpha() -> f64 {
    1e-4
}

fn default_beta() -> f64 {
    2.6
}

fn default_max_consecutive_failed() -> usize {
    3
}

fn default_directory() -> PathBuf {
    PathBuf::from("my_dir")
}

fn default_project_name() -> String {
    "helloworld".to_string()
}

/// The two-phase fine-tuning search space.
pub fn default_space() -> Vec<ParamSpec> {
    vec![
        ParamSpec::float("learning_rate", 1e-5, 1e-3, Sampling::Log),
        ParamSpec::int("num_epochs", 50, 300),
        ParamSpec::float("fine_learning_rate", 1e-7, 1e-5, Sampling::Log),
        ParamSpec::int("fine_num_epochs", 10, 100),
        ParamSpec::float("dropout", 0.0, 0.8, Sampling::Linear),
        ParamSpec::int("num_unfreeze_layers", 0, 100),
    ]
}

/// Where the best model is exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
            model_name: default_model_name(),
            version: default_version(),
        }
    }
}

impl ExportConfig {
    /// `<dir>/<model_name>/<version>`
    pub fn version_dir(&self) -> PathBuf {
        self.dir
            .join(&self.model_name)
            .join(self.version.to_string())
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("model")
}

fn default_model_name() -> String {
    "mobilenetv2".to_string()
}

fn default_version() -> u32 {
    1
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write JSON logs to a daily rolling file.
    #[serde(default = "default_true")]
    pub json_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_file: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RecycleConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.data.batch_size == 0 {
            return Err(ConfigError::invalid("data.batch_size must be positive"));
        }
        if !(self.data.validation_split > 0.0 && self.data.validation_split < 1.0) {
            return Err(ConfigError::invalid(format!(
                "data.validation_split must be in (0, 1), got {}",
                self.data.validation_split
            )));
        }
        if self.data.image_height < 32 || self.data.image_width < 32 {
            return Err(ConfigError::invalid(
                "data.image_height and data.image_width must be at least 32",
            ));
        }
        if self.model.width_multiplier <= 0.0 {
            return Err(ConfigError::invalid("model.width_multiplier must be positive"));
        }
        if !(0.0..1.0).contains(&self.model.label_smoothing) {
            return Err(ConfigError::invalid("model.label_smoothing must be in [0, 1)"));
        }
        if let Some(0) = self.model.num_classes {
            return Err(ConfigError::invalid("model.num_classes must be positive"));
        }
        if self.search.max_trials == 0 {
            return Err(ConfigError::invalid("search.max_trials must be positive"));
        }
        if self.search.space.is_empty() {
            return Err(ConfigError::invalid("search.space must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.search.space {
            if !seen.insert(spec.name()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate hyperparameter '{}'",
                    spec.name()
                )));
            }
            match spec {
                ParamSpec::Float {
                    name,
                    min,
                    max,
                    sampling,
                } => {
                    if !(min.is_finite() && max.is_finite()) || min > max {
                        return Err(ConfigError::invalid(format!(
                            "hyperparameter '{name}' has invalid range [{min}, {max}]"
                        )));
                    }
                    if *sampling == Sampling::Log && *min <= 0.0 {
                        return Err(ConfigError::invalid(format!(
                            "log-sampled hyperparameter '{name}' needs a positive minimum"
                        )));
                    }
                }
                ParamSpec::Int { name, min, max } => {
                    if min > max {
                        return Err(ConfigError::invalid(format!(
                            "hyperparameter '{name}' has invalid range [{min}, {max}]"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Anchor relative dataset, project, export and weight paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        anchor(&mut self.data.data_dir);
        anchor(&mut self.search.directory);
        anchor(&mut self.export.dir);
        if let Some(weights) = self.model.pretrained_weights.as_mut() {
            anchor(weights);
        }
    }

    /// Render as TOML (for `config show` / `config init`).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "recyclebot", "recyclebot")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".recyclebot").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`RECYCLEBOT_SEARCH__MAX_TRIALS`, ...)
/// 3. Explicit config file
/// 4. Workspace config (`.recyclebot/config.toml`)
/// 5. User config (`~/.config/recyclebot/config.toml`)
/// 6. Built-in defaults
///
/// With a workspace, relative paths in the result are taken from it.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: Option<&figment::value::Dict>,
) -> Result<RecycleConfig> {
    let mut figment = Figment::from(Serialized::defaults(RecycleConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("RECYCLEBOT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let mut config: RecycleConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    if let Some(ws) = workspace {
        config.resolve_paths(ws);
    }
    tracing::debug!(
        data_dir = %config.data.data_dir.display(),
        max_trials = config.search.max_trials,
        "Configuration loaded"
    );
    Ok(config)
}

/// Check whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
