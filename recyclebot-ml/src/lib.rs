//! # recyclebot-ml: transfer learning and hyperparameter search
//!
//! Trains a MobileNetV2 classifier on a directory of labelled waste images in
//! two phases (head only, then the top of the backbone) and searches the
//! phase hyperparameters with Bayesian optimization.

// Foundation
pub mod device;
pub mod error;

// Data and model
pub mod data;
pub mod model;

// Training and search
pub mod search;
pub mod training;

// Serving
pub mod export;

// Re-exports
pub use data::Dataset;
pub use device::{DeviceSelection, select_device};
pub use error::{MlError, Result};
pub use export::{ModelCard, Prediction, export_model, load_exported, predict, predict_file};
pub use model::{Classifier, ClassifierSpec};
pub use search::{FineTuner, HyperParameters, HyperValues, RecycleHyperModel, open_oracle};
pub use training::{History, Trainer, TrainingObserver};
