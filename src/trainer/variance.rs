//! Per-parameter gradient moments for adaptive loss weighting.
//!
//! For each criterion the trainer streams one flattened parameter-gradient
//! vector per sample through a [`RunningMoments`], then takes the
//! maximum-variance parameter as that criterion's representative noise
//! level. Weights follow `sqrt(supervised_variance / criterion_variance)`
//! with the supervised weight normalized to 1.0.

use tracing::warn;

/// Gradient magnitudes past this are logged during variance evaluation.
pub const GRADIENT_WARN_THRESHOLD: f32 = 10.0;

/// Streaming mean and variance per coordinate (Welford).
pub struct RunningMoments {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RunningMoments {
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    pub fn update(&mut self, sample: &[f32]) {
        self.count += 1;
        for (i, &x) in sample.iter().enumerate() {
            let x = x as f64;
            let delta = x - self.mean[i];
            self.mean[i] += delta / self.count as f64;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sample variance per coordinate; zero until two samples arrive.
    pub fn variance(&self, i: usize) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2[i] / (self.count - 1) as f64
        }
    }

    /// Variance of the most variable coordinate, with its index.
    pub fn max_variance(&self) -> (usize, f64) {
        let mut best = (0, 0.0);
        for i in 0..self.mean.len() {
            let v = self.variance(i);
            if v > best.1 {
                best = (i, v);
            }
        }
        best
    }
}

/// Log any gradient entry past the warning threshold.
pub fn warn_on_large_gradients(label: &str, sample: &[f32]) {
    for (i, &g) in sample.iter().enumerate() {
        if g.abs() > GRADIENT_WARN_THRESHOLD {
            warn!(
                criterion = label,
                parameter = i,
                gradient = g,
                "large gradient during variance evaluation"
            );
        }
    }
}

/// Derive loss weights from representative variances. Index 0 is the
/// supervised criterion and is pinned at 1.0; a degenerate variance keeps
/// the weight at 1.0 rather than producing an infinity.
pub fn variance_weights(variances: &[f64]) -> Vec<f32> {
    let sup = variances.first().copied().unwrap_or(0.0);
    variances
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if i == 0 || v <= 0.0 || sup <= 0.0 {
                1.0
            } else {
                (sup / v).sqrt() as f32
            }
        })
        .collect()
}
