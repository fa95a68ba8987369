//! Gaussian-process regression over the unit cube.
//!
//! Matern 5/2 kernel with unit amplitude on normalised targets. The length
//! scale is picked from a fixed grid by log marginal likelihood.

use crate::error::{MlError, Result};

const LENGTH_SCALES: [f64; 9] = [0.05, 0.1, 0.2, 0.35, 0.5, 0.75, 1.0, 1.5, 2.0];

pub fn matern52(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let r = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
        / length_scale;
    let s = 5f64.sqrt() * r;
    (1.0 + s + 5.0 * r * r / 3.0) * (-s).exp()
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
pub fn cholesky(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = a[i][i] - sum;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (a[i][j] - sum) / l[j][j];
            }
        }
    }
    Some(l)
}

/// Solve `L x = b` for lower-triangular `L`.
fn forward_substitute(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[i][k] * x[k]).sum();
        x[i] = (b[i] - sum) / l[i][i];
    }
    x
}

/// Solve `L^T x = b` for lower-triangular `L`.
fn back_substitute(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (b[i] - sum) / l[i][i];
    }
    x
}

#[derive(Debug, Clone)]
pub struct GaussianProcess {
    xs: Vec<Vec<f64>>,
    chol: Vec<Vec<f64>>,
    weights: Vec<f64>,
    y_mean: f64,
    y_std: f64,
    length_scale: f64,
    log_marginal_likelihood: f64,
}

impl GaussianProcess {
    /// Fit to `xs`/`ys` with observation noise `alpha`.
    pub fn fit(xs: &[Vec<f64>], ys: &[f64], alpha: f64) -> Result<Self> {
        if xs.is_empty() || xs.len() != ys.len() {
            return Err(MlError::search(format!(
                "cannot fit a GP to {} points and {} targets",
                xs.len(),
                ys.len()
            )));
        }
        let n = ys.len() as f64;
        let y_mean = ys.iter().sum::<f64>() / n;
        let var = ys.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / n;
        let y_std = if var > 1e-12 { var.sqrt() } else { 1.0 };
        let y: Vec<f64> = ys.iter().map(|v| (v - y_mean) / y_std).collect();

        let mut best: Option<Self> = None;
        for &ls in &LENGTH_SCALES {
            let Some(candidate) = Self::fit_with(xs, &y, alpha, ls, y_mean, y_std) else {
                continue;
            };
            if best
                .as_ref()
                .is_none_or(|b| candidate.log_marginal_likelihood > b.log_marginal_likelihood)
            {
                best = Some(candidate);
            }
        }
        best.ok_or_else(|| MlError::search("GP kernel matrix is not positive definite"))
    }

    fn fit_with(
        xs: &[Vec<f64>],
        y: &[f64],
        alpha: f64,
        length_scale: f64,
        y_mean: f64,
        y_std: f64,
    ) -> Option<Self> {
        let n = xs.len();
        let mut k = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..=i {
                let v = matern52(&xs[i], &xs[j], length_scale);
                k[i][j] = v;
                k[j][i] = v;
            }
            k[i][i] += alpha;
        }
        let chol = cholesky(&k)?;
        let weights = back_substitute(&chol, &forward_substitute(&chol, y));
        let data_fit: f64 = y.iter().zip(&weights).map(|(a, b)| a * b).sum();
        let log_det: f64 = (0..n).map(|i| chol[i][i].ln()).sum();
        let lml = -0.5 * data_fit - log_det - 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();
        Some(Self {
            xs: xs.to_vec(),
            chol,
            weights,
            y_mean,
            y_std,
            length_scale,
            log_marginal_likelihood: lml,
        })
    }

    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    /// Posterior mean and standard deviation at `x`, in target units.
    pub fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k_star: Vec<f64> = self
            .xs
            .iter()
            .map(|xi| matern52(xi, x, self.length_scale))
            .collect();
        let mean: f64 = k_star.iter().zip(&self.weights).map(|(a, b)| a * b).sum();
        let v = forward_substitute(&self.chol, &k_star);
        let var = (1.0 - v.iter().map(|a| a * a).sum::<f64>()).max(1e-12);
        (mean * self.y_std + self.y_mean, var.sqrt() * self.y_std)
    }
}
