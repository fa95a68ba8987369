//! MobileNetV2 feature extractor.
//!
//! The layer list mirrors the Keras `MobileNetV2` base layer for layer (154
//! entries: input, conv, batch norm, ReLU6, zero padding and add), ordered
//! from input to output so fine-tuning can unfreeze a suffix of it. Entries
//! without weights count towards the depth but own no variables.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// `(expansion t, output channels c, repeats n, first stride s)` per stage.
pub const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const BN_EPS: f64 = 1e-3;

/// Round `v` to the nearest multiple of `divisor`, never dropping more than 10%.
pub fn make_divisible(v: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut new_v = (((v + d / 2.0) / d).floor() * d).max(d) as usize;
    if (new_v as f64) < 0.9 * v {
        new_v += divisor;
    }
    new_v
}

/// Channel count of the final 1x1 convolution.
pub fn last_channels(width_multiplier: f64) -> usize {
    if width_multiplier > 1.0 {
        make_divisible(1280.0 * width_multiplier, 8)
    } else {
        1280
    }
}

/// Convolution followed by inference-mode batch norm and optional ReLU6.
///
/// Variables keep the dtype of the `VarBuilder` (F32); the forward pass casts
/// them to the dtype of its input.
#[derive(Debug, Clone)]
struct ConvBn {
    weight: Tensor,
    gamma: Tensor,
    beta: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    padding: usize,
    stride: usize,
    groups: usize,
    relu6: bool,
}

impl ConvBn {
    /// Registers `<prefix>.conv`, `<prefix>.bn` and, with ReLU6,
    /// `<prefix>.relu` in `layers`.
    #[allow(clippy::too_many_arguments)]
    fn new(
        vb: VarBuilder,
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        relu6: bool,
        layers: &mut Vec<String>,
        prefix: &str,
    ) -> Result<Self> {
        let weight = vb.pp("conv").get_with_hints(
            (out_c, in_c / groups, kernel, kernel),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bn = vb.pp("bn");
        let gamma = bn.get_with_hints(out_c, "weight", Init::Const(1.0))?;
        let beta = bn.get_with_hints(out_c, "bias", Init::Const(0.0))?;
        let running_mean = bn.get_with_hints(out_c, "running_mean", Init::Const(0.0))?;
        let running_var = bn.get_with_hints(out_c, "running_var", Init::Const(1.0))?;

        layers.push(format!("{prefix}.conv"));
        layers.push(format!("{prefix}.bn"));
        if relu6 {
            layers.push(format!("{prefix}.relu"));
        }
        Ok(Self {
            weight,
            gamma,
            beta,
            running_mean,
            running_var,
            padding: kernel / 2,
            stride,
            groups,
            relu6,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.conv2d(
            &self.weight.to_dtype(dtype)?,
            self.padding,
            self.stride,
            1,
            self.groups,
        )?;
        // batch norm folded into a per-channel scale and shift, in F32
        let scale = (&self.gamma / (&self.running_var + BN_EPS)?.sqrt()?)?;
        let shift = (&self.beta - (&self.running_mean * &scale)?)?;
        let scale = scale.to_dtype(dtype)?.reshape((1, (), 1, 1))?;
        let shift = shift.to_dtype(dtype)?.reshape((1, (), 1, 1))?;
        let xs = xs.broadcast_mul(&scale)?.broadcast_add(&shift)?;
        if self.relu6 {
            xs.clamp(0f32, 6f32)
        } else {
            Ok(xs)
        }
    }
}

#[derive(Debug, Clone)]
struct InvertedResidual {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    project: ConvBn,
    residual: bool,
}

impl InvertedResidual {
    fn new(
        vb: VarBuilder,
        in_c: usize,
        out_c: usize,
        stride: usize,
        expansion: usize,
        layers: &mut Vec<String>,
        prefix: &str,
    ) -> Result<Self> {
        let hidden = in_c * expansion;
        let expand = if expansion != 1 {
            Some(ConvBn::new(
                vb.pp("expand"),
                in_c,
                hidden,
                1,
                1,
                1,
                true,
                layers,
                &format!("{prefix}.expand"),
            )?)
        } else {
            None
        };
        if stride == 2 {
            layers.push(format!("{prefix}.pad"));
        }
        let depthwise = ConvBn::new(
            vb.pp("depthwise"),
            hidden,
            hidden,
            3,
            stride,
            hidden,
            true,
            layers,
            &format!("{prefix}.depthwise"),
        )?;
        let project = ConvBn::new(
            vb.pp("project"),
            hidden,
            out_c,
            1,
            1,
            1,
            false,
            layers,
            &format!("{prefix}.project"),
        )?;
        let residual = stride == 1 && in_c == out_c;
        if residual {
            layers.push(format!("{prefix}.add"));
        }
        Ok(Self {
            expand,
            depthwise,
            project,
            residual,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = match &self.expand {
            Some(expand) => expand.forward(xs)?,
            None => xs.clone(),
        };
        ys = self.depthwise.forward(&ys)?;
        ys = self.project.forward(&ys)?;
        if self.residual { xs + ys } else { Ok(ys) }
    }
}

/// The convolutional backbone without its ImageNet classifier.
#[derive(Debug, Clone)]
pub struct MobileNetV2 {
    stem: ConvBn,
    blocks: Vec<InvertedResidual>,
    last: ConvBn,
    layers: Vec<String>,
    out_channels: usize,
}

impl MobileNetV2 {
    /// Build under `vb` (conventionally scoped to `backbone`). Layer names are
    /// relative to `vb`'s prefix, passed as `prefix`.
    pub fn new(vb: VarBuilder, width_multiplier: f64, prefix: &str) -> Result<Self> {
        let mut layers = vec![format!("{prefix}.input")];
        let first = make_divisible(32.0 * width_multiplier, 8);
        let stem = ConvBn::new(
            vb.pp("stem"),
            3,
            first,
            3,
            2,
            1,
            true,
            &mut layers,
            &format!("{prefix}.stem"),
        )?;

        let mut blocks = Vec::new();
        let mut in_c = first;
        for &(t, c, n, s) in INVERTED_RESIDUAL_SETTINGS.iter() {
            let out_c = make_divisible(c as f64 * width_multiplier, 8);
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                let k = blocks.len();
                blocks.push(InvertedResidual::new(
                    vb.pp("blocks").pp(k.to_string()),
                    in_c,
                    out_c,
                    stride,
                    t,
                    &mut layers,
                    &format!("{prefix}.blocks.{k}"),
                )?);
                in_c = out_c;
            }
        }

        let out_channels = last_channels(width_multiplier);
        let last = ConvBn::new(
            vb.pp("last"),
            in_c,
            out_channels,
            1,
            1,
            1,
            true,
            &mut layers,
            &format!("{prefix}.last"),
        )?;

        Ok(Self {
            stem,
            blocks,
            last,
            layers,
            out_channels,
        })
    }

    /// Layer names, input to output; weighted layers are variable-name prefixes.
    pub fn layer_names(&self) -> &[String] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Map raw pixels in `[0, 255]` to `[-1, 1]` and extract features.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.affine(1.0 / 127.5, -1.0)?;
        xs = self.stem.forward(&xs)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        self.last.forward(&xs)
    }
}

impl Module for MobileNetV2 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        MobileNetV2::forward(self, xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(16.0 * 0.35, 8), 8);
        assert_eq!(make_divisible(24.0 * 0.75, 8), 24);
        assert_eq!(last_channels(1.0), 1280);
        assert_eq!(last_channels(1.4), 1792);
    }

    #[test]
    fn test_layer_count_and_order() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = MobileNetV2::new(vb.pp("backbone"), 0.35, "backbone").unwrap();
        // input + stem 3 + first block 5 + 16 blocks * 8 + 4 pads + 10 adds + last 3
        assert_eq!(net.num_layers(), 154);
        let names = net.layer_names();
        assert_eq!(names[0], "backbone.input");
        assert_eq!(names[1], "backbone.stem.conv");
        assert_eq!(names[3], "backbone.stem.relu");
        assert_eq!(names[4], "backbone.blocks.0.depthwise.conv");
        assert_eq!(names[12], "backbone.blocks.1.pad");
        assert_eq!(names[153], "backbone.last.relu");
        assert_eq!(names.iter().filter(|n| n.ends_with(".add")).count(), 10);
    }

    #[test]
    fn test_variables_stay_f32() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MobileNetV2::new(vb.pp("backbone"), 0.35, "backbone").unwrap();
        let vars = varmap.all_vars();
        assert!(!vars.is_empty());
        assert!(vars.iter().all(|v| v.dtype() == DType::F32));
    }

    #[test]
    fn test_forward_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = MobileNetV2::new(vb.pp("backbone"), 0.35, "backbone").unwrap();
        let xs = Tensor::zeros((1, 3, 64, 32), DType::F32, &Device::Cpu).unwrap();
        let ys = net.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 1280, 2, 1]);
    }
}
