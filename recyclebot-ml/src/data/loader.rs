//! Image dataset from a class-per-directory layout.
//!
//! ```text
//! data/
//! ├── cardboard/
//! │   ├── img_001.jpg
//! │   └── ...
//! ├── glass/
//! └── ...
//! ```

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{MlError, Result};

/// One labelled image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// Classes and samples discovered under a dataset root.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub root: PathBuf,
    /// Sorted class directory names; the index is the label.
    pub class_names: Vec<String>,
    pub samples: Vec<Sample>,
}

impl DirectoryListing {
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Samples per class, indexed by label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.class_names.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }
}

/// Discover class sub-directories and their image files.
pub fn scan_directory(root: &Path, extensions: &[String]) -> Result<DirectoryListing> {
    if !root.is_dir() {
        return Err(MlError::dataset(format!(
            "dataset directory does not exist: {}",
            root.display()
        )));
    }

    let mut class_names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                class_names.push(name.to_string());
            }
        }
    }
    class_names.sort();

    if class_names.is_empty() {
        return Err(MlError::dataset(format!(
            "no class directories found in {}",
            root.display()
        )));
    }

    let extensions: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
    let mut samples = Vec::new();
    for (label, class_name) in class_names.iter().enumerate() {
        let mut paths: Vec<PathBuf> = WalkDir::new(root.join(class_name))
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| has_extension(p, &extensions))
            .collect();
        paths.sort();
        tracing::debug!(class = %class_name, label, files = paths.len(), "Scanned class");
        samples.extend(paths.into_iter().map(|path| Sample { path, label }));
    }

    if samples.is_empty() {
        return Err(MlError::dataset(format!(
            "no image files found under {}",
            root.display()
        )));
    }

    tracing::info!(
        classes = class_names.len(),
        files = samples.len(),
        "Found {} files belonging to {} classes",
        samples.len(),
        class_names.len()
    );

    Ok(DirectoryListing {
        root: root.to_path_buf(),
        class_names,
        samples,
    })
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x == &e.to_lowercase()))
}

/// Shuffle once with `seed` and hold out the tail for validation.
///
/// Returns `(training, validation)`; the two subsets are disjoint.
pub fn split(samples: &[Sample], validation_split: f64, seed: u64) -> Result<(Vec<Sample>, Vec<Sample>)> {
    if !(validation_split > 0.0 && validation_split < 1.0) {
        return Err(MlError::invalid_input(format!(
            "validation_split must be in (0, 1), got {validation_split}"
        )));
    }

    let mut shuffled = samples.to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let num_val = (shuffled.len() as f64 * validation_split).floor() as usize;
    if num_val == 0 {
        return Err(MlError::dataset(format!(
            "validation split {validation_split} of {} files leaves no validation samples",
            shuffled.len()
        )));
    }
    if num_val == shuffled.len() {
        return Err(MlError::dataset("validation split leaves no training samples"));
    }

    let validation = shuffled.split_off(shuffled.len() - num_val);
    tracing::info!(
        training = shuffled.len(),
        validation = validation.len(),
        "Split dataset"
    );
    Ok((shuffled, validation))
}

/// Decoded, resized images held in memory as RGB `u8` rows (HWC).
#[derive(Debug, Clone)]
pub struct ImageSet {
    pub height: u32,
    pub width: u32,
    pub class_names: Vec<String>,
    images: Vec<Vec<u8>>,
    labels: Vec<u32>,
}

impl ImageSet {
    /// Build from already-decoded buffers. Each buffer must hold `height * width * 3` bytes.
    pub fn from_raw(
        height: u32,
        width: u32,
        class_names: Vec<String>,
        images: Vec<Vec<u8>>,
        labels: Vec<u32>,
    ) -> Result<Self> {
        let expected = (height * width * 3) as usize;
        if images.len() != labels.len() {
            return Err(MlError::invalid_input(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        if let Some(bad) = images.iter().position(|img| img.len() != expected) {
            return Err(MlError::invalid_input(format!(
                "image {bad} has {} bytes, expected {expected}",
                images[bad].len()
            )));
        }
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= class_names.len()) {
            return Err(MlError::invalid_input(format!(
                "label {label} out of range for {} classes",
                class_names.len()
            )));
        }
        Ok(Self {
            height,
            width,
            class_names,
            images,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn image(&self, index: usize) -> &[u8] {
        &self.images[index]
    }

    pub fn label(&self, index: usize) -> u32 {
        self.labels[index]
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

/// Decode and resize every sample in parallel.
///
/// Files that fail to decode are skipped with a warning.
pub fn load_images(
    samples: &[Sample],
    class_names: &[String],
    height: u32,
    width: u32,
) -> Result<ImageSet> {
    let decoded: Vec<(Vec<u8>, u32)> = samples
        .par_iter()
        .filter_map(|sample| match decode_resized(&sample.path, height, width) {
            Ok(bytes) => Some((bytes, sample.label as u32)),
            Err(e) => {
                tracing::warn!(path = %sample.path.display(), error = %e, "Skipping unreadable image");
                None
            }
        })
        .collect();

    if decoded.is_empty() {
        return Err(MlError::dataset("no images could be decoded"));
    }

    let skipped = samples.len() - decoded.len();
    if skipped > 0 {
        tracing::warn!(skipped, "Some images were skipped");
    }

    let (images, labels) = decoded.into_iter().unzip();
    ImageSet::from_raw(height, width, class_names.to_vec(), images, labels)
}

/// Decode one file and resize it to exactly `height x width` RGB.
pub fn decode_resized(path: &Path, height: u32, width: u32) -> Result<Vec<u8>> {
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    let resized = img.resize_exact(width, height, FilterType::Triangle);
    Ok(resized.to_rgb8().into_raw())
}
