//! Loading ImageNet backbone weights from safetensors.
//!
//! Two key layouts are understood: this crate's own (`backbone.*`, as written
//! by `VarMap::save`) and the timm `mobilenetv2_*` layout.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::{MlError, Result};
use crate::model::mobilenet::INVERTED_RESIDUAL_SETTINGS;

/// Map a timm parameter name to this crate's variable name.
pub fn map_timm_key(key: &str) -> Option<String> {
    if key.ends_with("num_batches_tracked") {
        return None;
    }
    if let Some(rest) = key.strip_prefix("blocks.") {
        let mut parts = rest.splitn(3, '.');
        let stage: usize = parts.next()?.parse().ok()?;
        let index: usize = parts.next()?.parse().ok()?;
        let tail = parts.next()?;
        let block = block_offset(stage)? + index;
        let (module, param) = tail.split_once('.')?;
        let expansion = INVERTED_RESIDUAL_SETTINGS.get(stage)?.0;
        let target = if expansion == 1 {
            match module {
                "conv_dw" => "depthwise.conv",
                "bn1" => "depthwise.bn",
                "conv_pw" => "project.conv",
                "bn2" => "project.bn",
                _ => return None,
            }
        } else {
            match module {
                "conv_pw" => "expand.conv",
                "bn1" => "expand.bn",
                "conv_dw" => "depthwise.conv",
                "bn2" => "depthwise.bn",
                "conv_pwl" => "project.conv",
                "bn3" => "project.bn",
                _ => return None,
            }
        };
        return Some(format!("backbone.blocks.{block}.{target}.{param}"));
    }
    if key == "conv_stem.weight" {
        return Some("backbone.stem.conv.weight".to_string());
    }
    if let Some(param) = key.strip_prefix("bn1.") {
        return Some(format!("backbone.stem.bn.{param}"));
    }
    if key == "conv_head.weight" {
        return Some("backbone.last.conv.weight".to_string());
    }
    if let Some(param) = key.strip_prefix("bn2.") {
        return Some(format!("backbone.last.bn.{param}"));
    }
    None
}

fn block_offset(stage: usize) -> Option<usize> {
    if stage >= INVERTED_RESIDUAL_SETTINGS.len() {
        return None;
    }
    Some(
        INVERTED_RESIDUAL_SETTINGS[..stage]
            .iter()
            .map(|&(_, _, n, _)| n)
            .sum(),
    )
}

/// Copy matching backbone tensors from `tensors` into `varmap`.
///
/// Returns the number of variables written. Tensors whose name or shape does
/// not match a backbone variable are ignored.
pub fn copy_backbone_tensors(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<usize> {
    let native = tensors.keys().any(|k| k.starts_with("backbone."));
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| MlError::model("variable store lock poisoned"))?;

    let mut copied = 0usize;
    for (key, tensor) in tensors {
        let target = if native {
            key.starts_with("backbone.").then(|| key.clone())
        } else {
            map_timm_key(key)
        };
        let Some(target) = target else {
            continue;
        };
        let Some(var) = vars.get(&target) else {
            tracing::trace!(key = %key, target = %target, "No backbone variable for tensor");
            continue;
        };
        if var.shape() != tensor.shape() {
            tracing::debug!(
                key = %key,
                expected = ?var.shape(),
                found = ?tensor.shape(),
                "Shape mismatch, skipping"
            );
            continue;
        }
        let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&value)?;
        copied += 1;
    }
    Ok(copied)
}

/// Load a safetensors file into the backbone variables of `varmap`.
pub fn load_pretrained_backbone(varmap: &VarMap, path: &Path) -> Result<usize> {
    if !path.exists() {
        return Err(MlError::not_found(format!(
            "pretrained weights {}",
            path.display()
        )));
    }
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let copied = copy_backbone_tensors(varmap, &tensors)?;
    if copied == 0 {
        return Err(MlError::model(format!(
            "no backbone tensors matched in {}",
            path.display()
        )));
    }
    tracing::info!(copied, path = %path.display(), "Loaded pretrained backbone");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mobilenet::MobileNetV2;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    #[test]
    fn test_map_timm_keys() {
        assert_eq!(
            map_timm_key("conv_stem.weight").as_deref(),
            Some("backbone.stem.conv.weight")
        );
        assert_eq!(
            map_timm_key("bn1.running_var").as_deref(),
            Some("backbone.stem.bn.running_var")
        );
        assert_eq!(
            map_timm_key("blocks.0.0.conv_pw.weight").as_deref(),
            Some("backbone.blocks.0.project.conv.weight")
        );
        assert_eq!(
            map_timm_key("blocks.2.1.conv_pwl.weight").as_deref(),
            Some("backbone.blocks.4.project.conv.weight")
        );
        assert_eq!(
            map_timm_key("blocks.6.0.bn1.bias").as_deref(),
            Some("backbone.blocks.16.expand.bn.bias")
        );
        assert_eq!(
            map_timm_key("bn2.weight").as_deref(),
            Some("backbone.last.bn.weight")
        );
        assert_eq!(map_timm_key("bn1.num_batches_tracked"), None);
        assert_eq!(map_timm_key("classifier.weight"), None);
        assert_eq!(map_timm_key("blocks.9.0.conv_pw.weight"), None);
    }

    #[test]
    fn test_copy_native_tensors() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MobileNetV2::new(vb.pp("backbone"), 0.35, "backbone").unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "backbone.stem.bn.bias".to_string(),
            Tensor::full(0.5f32, 16, &Device::Cpu).unwrap(),
        );
        // wrong shape is ignored
        tensors.insert(
            "backbone.stem.bn.weight".to_string(),
            Tensor::ones(3, DType::F32, &Device::Cpu).unwrap(),
        );
        let copied = copy_backbone_tensors(&varmap, &tensors).unwrap();
        assert_eq!(copied, 1);

        let vars = varmap.data().lock().unwrap();
        let bias: Vec<f32> = vars["backbone.stem.bn.bias"].as_tensor().to_vec1().unwrap();
        assert!(bias.iter().all(|&b| b == 0.5));
    }

    #[test]
    fn test_missing_file() {
        let varmap = VarMap::new();
        let err = load_pretrained_backbone(&varmap, Path::new("/nonexistent/w.safetensors"));
        assert!(matches!(err, Err(MlError::NotFound(_))));
    }
}
