//! Gradient-direction profiling across loss terms.
//!
//! For each hidden layer the profiler compares three gradient snapshots of
//! the layer's parameters: from the full joint loss, from the supervised
//! loss alone, and from the layer's own reconstruction loss alone. It
//! keeps running statistics of the pairwise angles. Purely observational;
//! nothing here feeds back into updates.

use tracing::info;

/// Running mean/min/max of an angle series, in degrees.
#[derive(Debug, Clone, Default)]
pub struct AngleStats {
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
}

impl AngleStats {
    fn update(&mut self, degrees: f64) {
        self.count += 1;
        if self.count == 1 {
            self.mean = degrees;
            self.min = degrees;
            self.max = degrees;
        } else {
            self.mean += (degrees - self.mean) / self.count as f64;
            self.min = self.min.min(degrees);
            self.max = self.max.max(degrees);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
}

/// Angle between two gradient vectors in degrees, `None` when either has
/// zero norm.
pub fn angle_between(a: &[f32], b: &[f32]) -> Option<f64> {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        na += x as f64 * x as f64;
        nb += y as f64 * y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    let cos = (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}

#[derive(Debug, Clone, Default)]
pub struct LayerAngles {
    pub joint_vs_supervised: AngleStats,
    pub joint_vs_local: AngleStats,
    pub supervised_vs_local: AngleStats,
}

pub struct GradientProfiler {
    layers: Vec<LayerAngles>,
}

impl GradientProfiler {
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![LayerAngles::default(); n_layers],
        }
    }

    /// Record one example's snapshots for `layer`.
    pub fn record(&mut self, layer: usize, joint: &[f32], supervised: &[f32], local: &[f32]) {
        let stats = &mut self.layers[layer];
        if let Some(a) = angle_between(joint, supervised) {
            stats.joint_vs_supervised.update(a);
        }
        if let Some(a) = angle_between(joint, local) {
            stats.joint_vs_local.update(a);
        }
        if let Some(a) = angle_between(supervised, local) {
            stats.supervised_vs_local.update(a);
        }
    }

    pub fn layer(&self, i: usize) -> &LayerAngles {
        &self.layers[i]
    }

    pub fn log_summary(&self) {
        for (i, stats) in self.layers.iter().enumerate() {
            info!(
                layer = i,
                joint_vs_supervised = format!("{:.1}", stats.joint_vs_supervised.mean),
                joint_vs_local = format!("{:.1}", stats.joint_vs_local.mean),
                supervised_vs_local = format!("{:.1}", stats.supervised_vs_local.mean),
                samples = stats.joint_vs_supervised.count,
                "gradient angle summary (degrees)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn orthogonal_vectors_measure_ninety_degrees() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert_relative_eq!(angle_between(&a, &b).unwrap(), 90.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_vector_yields_no_angle() {
        assert!(angle_between(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }

    #[test]
    fn running_mean_over_records() {
        let mut p = GradientProfiler::new(1);
        p.record(0, &[1.0, 0.0], &[0.0, 1.0], &[1.0, 0.0]);
        p.record(0, &[1.0, 0.0], &[1.0, 0.0], &[1.0, 0.0]);
        let stats = p.layer(0);
        assert_eq!(stats.joint_vs_supervised.count(), 2);
        assert_relative_eq!(stats.joint_vs_supervised.mean(), 45.0, epsilon = 1e-9);
        assert_relative_eq!(stats.joint_vs_local.mean(), 0.0, epsilon = 1e-9);
    }
}
