//! Dataset loading: directory scan, train/validation split, in-memory cache, batching.

pub mod batch;
pub mod loader;

pub use batch::{Batch, batch_indices, make_batch, smoothed_one_hot};
pub use loader::{DirectoryListing, ImageSet, Sample, load_images, scan_directory, split};

use recyclebot_core::DataConfig;

use crate::error::Result;

/// Training and validation images, decoded and cached.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub class_names: Vec<String>,
    pub train: ImageSet,
    pub valid: ImageSet,
}

impl Dataset {
    /// Scan, split and decode the dataset described by `config`.
    pub fn load(config: &DataConfig) -> Result<Self> {
        let listing = scan_directory(&config.data_dir, &config.extensions)?;
        let (train, valid) = split(&listing.samples, config.validation_split, config.seed)?;
        tracing::info!(
            classes = ?listing.class_names,
            counts = ?listing.class_counts(),
            train = train.len(),
            valid = valid.len(),
            "Dataset scanned"
        );
        let train = load_images(
            &train,
            &listing.class_names,
            config.image_height,
            config.image_width,
        )?;
        let valid = load_images(
            &valid,
            &listing.class_names,
            config.image_height,
            config.image_width,
        )?;
        Ok(Self {
            class_names: listing.class_names,
            train,
            valid,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}
