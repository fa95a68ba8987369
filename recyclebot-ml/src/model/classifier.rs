//! Backbone + prediction head, with layer-wise freezing.

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor, Var};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::model::mobilenet::MobileNetV2;
use crate::model::pretrained::load_pretrained_backbone;

const BACKBONE: &str = "backbone";
const HEAD: &str = "prediction";

/// Everything needed to rebuild a classifier's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSpec {
    pub num_classes: usize,
    pub input_height: u32,
    pub input_width: u32,
    pub width_multiplier: f64,
    pub dropout: f64,
}

/// MobileNetV2 backbone with a pooling / dropout / dense head.
///
/// Variables are always F32, so the optimizer steps full-precision weights
/// and saved files load on any device. `dtype` is the compute dtype of the
/// backbone; the head runs in F32.
pub struct Classifier {
    spec: ClassifierSpec,
    varmap: VarMap,
    backbone: MobileNetV2,
    dropout: Dropout,
    logits: Linear,
    unfrozen_layers: usize,
    device: Device,
    dtype: DType,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("spec", &self.spec)
            .field("unfrozen_layers", &self.unfrozen_layers)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Classifier {
    /// Build with a frozen backbone, optionally loading pretrained weights.
    pub fn new(
        spec: ClassifierSpec,
        device: &Device,
        dtype: DType,
        pretrained: Option<&Path>,
    ) -> Result<Self> {
        if spec.num_classes == 0 {
            return Err(MlError::invalid_input("num_classes must be positive"));
        }
        if !(0.0..1.0).contains(&spec.dropout) {
            return Err(MlError::invalid_input(format!(
                "dropout must be in [0, 1), got {}",
                spec.dropout
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let backbone = MobileNetV2::new(vb.pp(BACKBONE), spec.width_multiplier, BACKBONE)?;
        let logits = candle_nn::linear(
            backbone.out_channels(),
            spec.num_classes,
            vb.pp(HEAD).pp("logits"),
        )?;

        if let Some(path) = pretrained {
            load_pretrained_backbone(&varmap, path)?;
        }

        Ok(Self {
            dropout: Dropout::new(spec.dropout as f32),
            spec,
            varmap,
            backbone,
            logits,
            unfrozen_layers: 0,
            device: device.clone(),
            dtype,
        })
    }

    pub fn spec(&self) -> &ClassifierSpec {
        &self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Compute dtype of the backbone.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_backbone_layers(&self) -> usize {
        self.backbone.num_layers()
    }

    /// Number of trailing backbone layers currently trainable.
    pub fn unfrozen_layers(&self) -> usize {
        self.unfrozen_layers
    }

    pub fn freeze_backbone(&mut self) {
        self.unfrozen_layers = 0;
    }

    /// Make the last `n` backbone layers trainable and freeze the rest.
    ///
    /// `n` larger than the layer count unfreezes the whole backbone. Returns
    /// the effective count.
    pub fn unfreeze_last(&mut self, n: usize) -> usize {
        let total = self.backbone.num_layers();
        if n > total {
            tracing::warn!(requested = n, total, "Unfreeze depth exceeds backbone, unfreezing all layers");
        }
        self.unfrozen_layers = n.min(total);
        self.unfrozen_layers
    }

    /// Variables the optimizer may update, sorted by name.
    ///
    /// Batch-norm running statistics are never trainable.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let layers = self.backbone.layer_names();
        let unfrozen = &layers[layers.len() - self.unfrozen_layers..];
        let head_prefix = format!("{HEAD}.");

        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| MlError::model("variable store lock poisoned"))?;
        let mut selected: Vec<(&String, &Var)> = vars
            .iter()
            .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
            .filter(|(name, _)| {
                name.starts_with(&head_prefix)
                    || unfrozen
                        .iter()
                        .any(|layer| name.strip_prefix(layer.as_str()).is_some_and(|r| r.starts_with('.')))
            })
            .collect();
        selected.sort_by(|a, b| a.0.cmp(b.0));
        Ok(selected.into_iter().map(|(_, v)| v.clone()).collect())
    }

    /// Total number of scalar parameters in trainable variables.
    pub fn trainable_param_count(&self) -> Result<usize> {
        Ok(self.trainable_vars()?.iter().map(|v| v.elem_count()).sum())
    }

    /// Logits in F32, shape `(batch, num_classes)`.
    ///
    /// The backbone always runs in inference mode; `train` only toggles dropout.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut features = self.backbone.forward(&xs.to_dtype(self.dtype)?)?;
        if self.unfrozen_layers == 0 {
            features = features.detach();
        }
        let pooled = features.mean((2, 3))?.to_dtype(DType::F32)?;
        let pooled = self.dropout.forward(&pooled, train)?;
        Ok(self.logits.forward(&pooled)?)
    }

    /// Softmax probabilities in F32.
    pub fn probabilities(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.forward_t(xs, false)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }

    /// Write all weights to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap.save(path)?;
        Ok(())
    }

    /// Load all weights from a safetensors file written by [`Classifier::save`].
    pub fn load(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(MlError::not_found(format!("weights {}", path.display())));
        }
        self.varmap.load(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageSet;
    use crate::training::{NoOpObserver, OptimizerConfig, Trainer};
    use recyclebot_core::config::AugmentConfig;
    use tempfile::TempDir;

    fn tiny_spec() -> ClassifierSpec {
        ClassifierSpec {
            num_classes: 3,
            input_height: 32,
            input_width: 32,
            width_multiplier: 0.35,
            dropout: 0.2,
        }
    }

    #[test]
    fn test_frozen_backbone_trains_head_only() {
        let model = Classifier::new(tiny_spec(), &Device::Cpu, DType::F32, None).unwrap();
        let vars = model.trainable_vars().unwrap();
        // logits weight + bias
        assert_eq!(vars.len(), 2);
        assert_eq!(model.trainable_param_count().unwrap(), 1280 * 3 + 3);
    }

    #[test]
    fn test_unfreeze_last_layers() {
        let mut model = Classifier::new(tiny_spec(), &Device::Cpu, DType::F32, None).unwrap();
        // last.relu owns no variables
        assert_eq!(model.unfreeze_last(1), 1);
        assert_eq!(model.trainable_vars().unwrap().len(), 2);
        // last.relu + last.bn: bn weight, bn bias
        assert_eq!(model.unfreeze_last(2), 2);
        assert_eq!(model.trainable_vars().unwrap().len(), 2 + 2);
        // + last.conv weight
        assert_eq!(model.unfreeze_last(3), 3);
        assert_eq!(model.trainable_vars().unwrap().len(), 2 + 3);
        assert_eq!(model.num_backbone_layers(), 154);

        assert_eq!(model.unfreeze_last(1000), model.num_backbone_layers());

        model.freeze_backbone();
        assert_eq!(model.trainable_vars().unwrap().len(), 2);
    }

    #[test]
    fn test_forward_and_probabilities() {
        let model = Classifier::new(tiny_spec(), &Device::Cpu, DType::F32, None).unwrap();
        let xs = Tensor::full(128f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let logits = model.forward_t(&xs, true).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
        let probs: Vec<Vec<f32>> = model.probabilities(&xs).unwrap().to_vec2().unwrap();
        for row in probs {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = Classifier::new(tiny_spec(), &Device::Cpu, DType::F32, None).unwrap();
        model.save(&path).unwrap();

        let xs = Tensor::full(10f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let expected: Vec<f32> = model.probabilities(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        let mut restored = Classifier::new(tiny_spec(), &Device::Cpu, DType::F32, None).unwrap();
        restored.load(&path).unwrap();
        let actual: Vec<f32> = restored.probabilities(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    fn var_values(model: &Classifier, name: &str) -> Vec<f32> {
        let vars = model.varmap.data().lock().unwrap();
        vars[name].as_tensor().flatten_all().unwrap().to_vec1().unwrap()
    }

    fn two_tone_set() -> ImageSet {
        let images = (0..8)
            .map(|i| vec![if i % 2 == 0 { 10u8 } else { 240u8 }; 32 * 32 * 3])
            .collect();
        let labels = (0..8).map(|i| (i % 3) as u32).collect();
        let names = vec!["a".into(), "b".into(), "c".into()];
        ImageSet::from_raw(32, 32, names, images, labels).unwrap()
    }

    #[test]
    fn test_fit_updates_only_unfrozen_layers() {
        let mut model = Classifier::new(tiny_spec(), &Device::Cpu, DType::F32, None).unwrap();
        model.unfreeze_last(3);
        let frozen = [
            "backbone.stem.conv.weight",
            "backbone.blocks.16.project.conv.weight",
            "backbone.blocks.16.project.bn.bias",
            "backbone.last.bn.running_mean",
        ];
        let trainable = ["backbone.last.conv.weight", "backbone.last.bn.bias"];
        let before: Vec<Vec<f32>> = frozen
            .iter()
            .chain(trainable.iter())
            .map(|name| var_values(&model, name))
            .collect();

        let data = two_tone_set();
        Trainer::new(4, 0.0, AugmentConfig::default(), 3)
            .fit(
                &model,
                OptimizerConfig::adam(1e-2),
                &data,
                &data,
                0,
                3,
                &mut [],
                &mut NoOpObserver,
            )
            .unwrap();

        for (name, old) in frozen.iter().zip(&before) {
            assert_eq!(&var_values(&model, name), old, "{name} changed");
        }
        for (name, old) in trainable.iter().zip(&before[frozen.len()..]) {
            assert_ne!(&var_values(&model, name), old, "{name} did not train");
        }
    }

    #[test]
    fn test_half_precision_compute_keeps_f32_variables() {
        let model = Classifier::new(tiny_spec(), &Device::Cpu, DType::F16, None).unwrap();
        assert_eq!(model.dtype(), DType::F16);
        let vars = model.varmap.all_vars();
        assert!(vars.iter().all(|v| v.dtype() == DType::F32));
        assert!(
            model
                .trainable_vars()
                .unwrap()
                .iter()
                .all(|v| v.dtype() == DType::F32)
        );
    }

    #[test]
    fn test_rejects_bad_spec() {
        let mut spec = tiny_spec();
        spec.dropout = 1.0;
        assert!(Classifier::new(spec, &Device::Cpu, DType::F32, None).is_err());
        let mut spec = tiny_spec();
        spec.num_classes = 0;
        assert!(Classifier::new(spec, &Device::Cpu, DType::F32, None).is_err());
    }
}
