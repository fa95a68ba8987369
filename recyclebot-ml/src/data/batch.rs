//! Batching, flip augmentation and label encoding.

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use recyclebot_core::config::AugmentConfig;

use crate::data::loader::ImageSet;
use crate::error::{MlError, Result};

/// A batch ready for the model.
#[derive(Debug)]
pub struct Batch {
    /// `(n, 3, h, w)` raw pixel values in `[0, 255]`.
    pub images: Tensor,
    /// `(n,)` class indices as `u32`.
    pub labels: Tensor,
    pub label_values: Vec<u32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.label_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_values.is_empty()
    }
}

/// Split `0..len` into batches, optionally shuffled.
pub fn batch_indices(len: usize, batch_size: usize, rng: Option<&mut ChaCha8Rng>) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Some(rng) = rng {
        order.shuffle(rng);
    }
    order
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

/// Assemble the images at `indices` into an NCHW tensor of `dtype`.
pub fn make_batch(
    set: &ImageSet,
    indices: &[usize],
    augment: Option<(&AugmentConfig, &mut ChaCha8Rng)>,
    device: &Device,
    dtype: DType,
) -> Result<Batch> {
    if indices.is_empty() {
        return Err(MlError::invalid_input("empty batch"));
    }
    let (h, w) = (set.height as usize, set.width as usize);
    let mut pixels = Vec::with_capacity(indices.len() * h * w * 3);
    let mut label_values = Vec::with_capacity(indices.len());

    let mut augment = augment;
    for &i in indices {
        let mut img = set.image(i).to_vec();
        if let Some((cfg, rng)) = augment.as_mut() {
            if cfg.horizontal_flip && rng.gen_bool(0.5) {
                flip_horizontal(&mut img, h, w);
            }
            if cfg.vertical_flip && rng.gen_bool(0.5) {
                flip_vertical(&mut img, h, w);
            }
        }
        pixels.extend_from_slice(&img);
        label_values.push(set.label(i));
    }

    let n = indices.len();
    let images = Tensor::from_vec(pixels, (n, h, w, 3), device)?
        .permute((0, 3, 1, 2))?
        .to_dtype(dtype)?
        .contiguous()?;
    let labels = Tensor::from_vec(label_values.clone(), n, device)?;
    Ok(Batch {
        images,
        labels,
        label_values,
    })
}

/// Mirror an HWC RGB buffer left to right.
pub fn flip_horizontal(img: &mut [u8], h: usize, w: usize) {
    for row in img.chunks_exact_mut(w * 3).take(h) {
        for x in 0..w / 2 {
            let (a, b) = (x * 3, (w - 1 - x) * 3);
            for c in 0..3 {
                row.swap(a + c, b + c);
            }
        }
    }
}

/// Mirror an HWC RGB buffer top to bottom.
pub fn flip_vertical(img: &mut [u8], h: usize, w: usize) {
    let stride = w * 3;
    for y in 0..h / 2 {
        let (top, bottom) = img.split_at_mut((h - 1 - y) * stride);
        top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
    }
}

/// One-hot targets with label smoothing: `y * (1 - s) + s / k`.
pub fn smoothed_one_hot(labels: &[u32], num_classes: usize, smoothing: f64) -> Vec<f32> {
    let off = (smoothing / num_classes as f64) as f32;
    let on = (1.0 - smoothing) as f32 + off;
    let mut out = vec![off; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        out[row * num_classes + label as usize] = on;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_set() -> ImageSet {
        let images = (0..5u8).map(|i| vec![i; 2 * 3 * 3]).collect();
        ImageSet::from_raw(2, 3, vec!["a".into(), "b".into()], images, vec![0, 1, 0, 1, 1]).unwrap()
    }

    #[test]
    fn test_batch_indices_cover_everything() {
        let batches = batch_indices(10, 4, None);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![8, 9]);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut all: Vec<usize> = batch_indices(10, 4, Some(&mut rng)).concat();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_make_batch_shapes() {
        let set = tiny_set();
        let batch = make_batch(&set, &[0, 3, 4], None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(batch.images.dims(), &[3, 3, 2, 3]);
        assert_eq!(batch.label_values, vec![0, 1, 1]);
        let first: Vec<f32> = batch.images.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(first[0], 0.0);
        assert_eq!(first[first.len() - 1], 4.0);
    }

    #[test]
    fn test_flip_horizontal() {
        // 1 row, 2 pixels
        let mut img = vec![1, 2, 3, 4, 5, 6];
        flip_horizontal(&mut img, 1, 2);
        assert_eq!(img, vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn test_flip_vertical() {
        // 3 rows, 1 pixel
        let mut img = vec![1, 1, 1, 2, 2, 2, 3, 3, 3];
        flip_vertical(&mut img, 3, 1);
        assert_eq!(img, vec![3, 3, 3, 2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_smoothed_one_hot() {
        let targets = smoothed_one_hot(&[2, 0], 4, 0.1);
        assert_eq!(targets.len(), 8);
        assert!((targets[2] - 0.925).abs() < 1e-6);
        assert!((targets[0] - 0.025).abs() < 1e-6);
        let row_sum: f32 = targets[..4].iter().sum();
        assert!((row_sum - 1.0).abs() < 1e-6);

        let hard = smoothed_one_hot(&[1], 3, 0.0);
        assert_eq!(hard, vec![0.0, 1.0, 0.0]);
    }
}
