//! MobileNetV2 transfer-learning model.

pub mod classifier;
pub mod mobilenet;
pub mod pretrained;

pub use classifier::{Classifier, ClassifierSpec};
pub use mobilenet::MobileNetV2;
pub use pretrained::load_pretrained_backbone;
