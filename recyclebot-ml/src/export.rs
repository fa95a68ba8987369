//! Exporting the best model and serving predictions from an export.
//!
//! An export lives at `<dir>/<model_name>/<version>/` and holds the weights
//! (`model.safetensors`) next to a `model.json` card describing how to
//! rebuild and feed the model.

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use image::imageops::FilterType;
use recyclebot_core::ExportConfig;
use recyclebot_core::persistence::{atomic_write_json, load_json};
use serde::{Deserialize, Serialize};

use crate::device::DeviceSelection;
use crate::error::{MlError, Result};
use crate::model::{Classifier, ClassifierSpec};
use crate::search::HyperValues;
use crate::training::{EnvironmentSnapshot, file_sha256};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CARD_FILE: &str = "model.json";

/// Metadata written next to exported weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub class_names: Vec<String>,
    pub spec: ClassifierSpec,
    pub hyperparameters: HyperValues,
    pub val_accuracy: Option<f64>,
    pub weights_sha256: String,
    #[serde(default)]
    pub environment: Option<EnvironmentSnapshot>,
    pub created_at: DateTime<Utc>,
}

/// What the caller knows about the model beyond its weights.
#[derive(Debug, Clone, Default)]
pub struct ExportMetadata {
    pub class_names: Vec<String>,
    pub hyperparameters: HyperValues,
    pub val_accuracy: Option<f64>,
    pub environment: Option<EnvironmentSnapshot>,
}

/// Write `model` under the versioned export directory.
///
/// Refuses to replace an existing export of the same version unless `force`.
pub fn export_model(
    model: &Classifier,
    metadata: ExportMetadata,
    config: &ExportConfig,
    force: bool,
) -> Result<PathBuf> {
    if metadata.class_names.len() != model.spec().num_classes {
        return Err(MlError::export(format!(
            "{} class names for a model with {} classes",
            metadata.class_names.len(),
            model.spec().num_classes
        )));
    }
    let dir = config.version_dir();
    if dir.join(CARD_FILE).exists() && !force {
        return Err(MlError::export(format!(
            "{} already exists, bump the version or force the export",
            dir.display()
        )));
    }
    std::fs::create_dir_all(&dir)?;

    let weights = dir.join(WEIGHTS_FILE);
    model.save(&weights)?;
    let card = ModelCard {
        id: uuid::Uuid::new_v4().to_string(),
        name: config.model_name.clone(),
        version: config.version,
        class_names: metadata.class_names,
        spec: model.spec().clone(),
        hyperparameters: metadata.hyperparameters,
        val_accuracy: metadata.val_accuracy,
        weights_sha256: file_sha256(&weights)?,
        environment: metadata.environment,
        created_at: Utc::now(),
    };
    atomic_write_json(&dir.join(CARD_FILE), &card)?;
    tracing::info!(dir = %dir.display(), "Exported model");
    Ok(dir)
}

/// Rebuild an exported model on `selection`'s device.
pub fn load_exported(dir: &Path, selection: &DeviceSelection) -> Result<(Classifier, ModelCard)> {
    let card: ModelCard = load_json(&dir.join(CARD_FILE))?
        .ok_or_else(|| MlError::not_found(format!("model card in {}", dir.display())))?;
    let weights = dir.join(WEIGHTS_FILE);
    if !weights.exists() {
        return Err(MlError::not_found(format!("weights {}", weights.display())));
    }
    if file_sha256(&weights)? != card.weights_sha256 {
        return Err(MlError::export(format!(
            "{} does not match the hash in its model card",
            weights.display()
        )));
    }
    let mut model = Classifier::new(card.spec.clone(), &selection.device, selection.dtype, None)?;
    model.load(&weights)?;
    Ok((model, card))
}

/// One class and its probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

/// Bring an image to `height x width`: centre crop when it is large enough,
/// otherwise stretch.
pub fn fit_to_input(img: &DynamicImage, height: u32, width: u32) -> DynamicImage {
    if img.width() >= width && img.height() >= height {
        let x = (img.width() - width) / 2;
        let y = (img.height() - height) / 2;
        img.crop_imm(x, y, width, height)
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Top-`top_k` classes for one decoded image.
pub fn predict(
    model: &Classifier,
    card: &ModelCard,
    img: &DynamicImage,
    top_k: usize,
) -> Result<Vec<Prediction>> {
    let (h, w) = (card.spec.input_height, card.spec.input_width);
    let pixels = fit_to_input(img, h, w).to_rgb8().into_raw();
    let xs = Tensor::from_vec(pixels, (1, h as usize, w as usize, 3), model.device())?
        .permute((0, 3, 1, 2))?
        .to_dtype(model.dtype())?
        .contiguous()?;
    let probs: Vec<f32> = model.probabilities(&xs)?.flatten_all()?.to_vec1()?;

    let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked
        .into_iter()
        .take(top_k.max(1))
        .map(|(i, probability)| Prediction {
            label: card
                .class_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("class_{i}")),
            probability,
        })
        .collect())
}

/// Decode `path` and predict.
pub fn predict_file(
    model: &Classifier,
    card: &ModelCard,
    path: &Path,
    top_k: usize,
) -> Result<Vec<Prediction>> {
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    predict(model, card, &img, top_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    fn tiny_model() -> Classifier {
        let spec = ClassifierSpec {
            num_classes: 3,
            input_height: 32,
            input_width: 24,
            width_multiplier: 0.35,
            dropout: 0.1,
        };
        Classifier::new(spec, &Device::Cpu, DType::F32, None).unwrap()
    }

    fn metadata() -> ExportMetadata {
        ExportMetadata {
            class_names: vec!["cardboard".into(), "glass".into(), "metal".into()],
            val_accuracy: Some(0.8),
            ..Default::default()
        }
    }

    fn export_config(dir: &Path) -> ExportConfig {
        ExportConfig {
            dir: dir.to_path_buf(),
            model_name: "mobilenetv2".into(),
            version: 1,
        }
    }

    #[test]
    fn test_export_layout_and_reload() {
        let tmp = TempDir::new().unwrap();
        let model = tiny_model();
        let dir = export_model(&model, metadata(), &export_config(tmp.path()), false).unwrap();
        assert_eq!(dir, tmp.path().join("mobilenetv2").join("1"));
        assert!(dir.join(WEIGHTS_FILE).exists());

        let (loaded, card) = load_exported(&dir, &DeviceSelection::cpu()).unwrap();
        assert_eq!(card.class_names.len(), 3);
        assert_eq!(card.spec, *model.spec());
        assert_eq!(loaded.spec().input_width, 24);
    }

    #[test]
    fn test_half_precision_export_loads_on_cpu() {
        let tmp = TempDir::new().unwrap();
        let spec = tiny_model().spec().clone();
        let model = Classifier::new(spec, &Device::Cpu, DType::F16, None).unwrap();
        let dir = export_model(&model, metadata(), &export_config(tmp.path()), false).unwrap();

        let (loaded, card) = load_exported(&dir, &DeviceSelection::cpu()).unwrap();
        assert_eq!(loaded.dtype(), DType::F32);

        let path = tmp.path().join("can.png");
        image::RgbImage::from_pixel(24, 32, image::Rgb([200, 200, 210]))
            .save(&path)
            .unwrap();
        assert_eq!(predict_file(&loaded, &card, &path, 3).unwrap().len(), 3);
    }

    #[test]
    fn test_export_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        let model = tiny_model();
        let config = export_config(tmp.path());
        export_model(&model, metadata(), &config, false).unwrap();
        assert!(export_model(&model, metadata(), &config, false).is_err());
        export_model(&model, metadata(), &config, true).unwrap();
    }

    #[test]
    fn test_export_checks_class_names() {
        let tmp = TempDir::new().unwrap();
        let mut meta = metadata();
        meta.class_names.pop();
        assert!(export_model(&tiny_model(), meta, &export_config(tmp.path()), false).is_err());
    }

    #[test]
    fn test_load_detects_corrupt_weights() {
        let tmp = TempDir::new().unwrap();
        let dir = export_model(&tiny_model(), metadata(), &export_config(tmp.path()), false).unwrap();
        std::fs::write(dir.join(WEIGHTS_FILE), b"not safetensors").unwrap();
        assert!(load_exported(&dir, &DeviceSelection::cpu()).is_err());
    }

    #[test]
    fn test_fit_to_input_crops_or_resizes() {
        let big = DynamicImage::new_rgb8(100, 80);
        let cropped = fit_to_input(&big, 32, 24);
        assert_eq!((cropped.width(), cropped.height()), (24, 32));
        let small = DynamicImage::new_rgb8(10, 10);
        let resized = fit_to_input(&small, 32, 24);
        assert_eq!((resized.width(), resized.height()), (24, 32));
    }

    #[test]
    fn test_predict_top_k() {
        let tmp = TempDir::new().unwrap();
        let model = tiny_model();
        let dir = export_model(&model, metadata(), &export_config(tmp.path()), false).unwrap();
        let (model, card) = load_exported(&dir, &DeviceSelection::cpu()).unwrap();

        let path = tmp.path().join("bottle.png");
        image::RgbImage::from_pixel(64, 48, image::Rgb([20, 180, 40]))
            .save(&path)
            .unwrap();
        let preds = predict_file(&model, &card, &path, 2).unwrap();
        assert_eq!(preds.len(), 2);
        assert!(preds[0].probability >= preds[1].probability);
        let all = predict_file(&model, &card, &path, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!((all.iter().map(|p| p.probability).sum::<f32>() - 1.0).abs() < 1e-4);
    }
}
