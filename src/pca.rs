//! Leading-eigenvector estimation of gradient covariance.
//!
//! Analysis tools stream flattened parameter-gradient vectors through
//! [`PcaGradientEstimator::observe`]; the estimator folds them into a
//! discounted covariance estimate one minibatch at a time and extracts
//! leading eigenpairs on demand with a cyclic Jacobi sweep. Everything is
//! in f64: covariance entries are differences of products of f32 values
//! and lose too much in single precision.

use crate::error::{Error, Result};

pub struct PcaGradientEstimator {
    dim: usize,
    batch_size: usize,
    /// Weight kept on the previous covariance estimate per fold.
    discount: f64,
    pending: Vec<Vec<f64>>,
    mean: Vec<f64>,
    covariance: Vec<f64>,
    folds: u64,
}

impl PcaGradientEstimator {
    pub fn new(dim: usize, batch_size: usize, discount: f64) -> Result<Self> {
        if dim == 0 {
            return Err(Error::config("estimator dimension must be nonzero"));
        }
        if batch_size < 2 {
            return Err(Error::config("estimator batch size must be at least 2"));
        }
        if !(0.0..1.0).contains(&discount) {
            return Err(Error::config(format!(
                "discount {discount} outside [0, 1)"
            )));
        }
        Ok(Self {
            dim,
            batch_size,
            discount,
            pending: Vec::new(),
            mean: vec![0.0; dim],
            covariance: vec![0.0; dim * dim],
            folds: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of completed minibatch folds.
    pub fn folds(&self) -> u64 {
        self.folds
    }

    pub fn observe(&mut self, sample: &[f32]) -> Result<()> {
        if sample.len() != self.dim {
            return Err(Error::dimension(format!(
                "estimator sample has {} values, expected {}",
                sample.len(),
                self.dim
            )));
        }
        self.pending
            .push(sample.iter().map(|&x| x as f64).collect());
        if self.pending.len() == self.batch_size {
            self.fold();
        }
        Ok(())
    }

    /// Fold the pending minibatch into the running mean and covariance.
    fn fold(&mut self) {
        let n = self.pending.len();
        if n < 2 {
            self.pending.clear();
            return;
        }
        let mut batch_mean = vec![0.0; self.dim];
        for sample in &self.pending {
            for (m, &x) in batch_mean.iter_mut().zip(sample.iter()) {
                *m += x;
            }
        }
        for m in batch_mean.iter_mut() {
            *m /= n as f64;
        }

        let mut batch_cov = vec![0.0; self.dim * self.dim];
        for sample in &self.pending {
            for i in 0..self.dim {
                let di = sample[i] - batch_mean[i];
                for j in i..self.dim {
                    batch_cov[i * self.dim + j] += di * (sample[j] - batch_mean[j]);
                }
            }
        }
        let denom = (n - 1) as f64;
        for i in 0..self.dim {
            for j in i..self.dim {
                let v = batch_cov[i * self.dim + j] / denom;
                batch_cov[i * self.dim + j] = v;
                batch_cov[j * self.dim + i] = v;
            }
        }

        let keep = if self.folds == 0 { 0.0 } else { self.discount };
        for (c, &b) in self.covariance.iter_mut().zip(batch_cov.iter()) {
            *c = keep * *c + (1.0 - keep) * b;
        }
        for (m, &b) in self.mean.iter_mut().zip(batch_mean.iter()) {
            *m = keep * *m + (1.0 - keep) * b;
        }
        self.folds += 1;
        self.pending.clear();
    }

    /// Leading `count` eigenpairs of the current covariance estimate, in
    /// descending eigenvalue order. Partial pending samples are folded in
    /// first when they form a usable batch.
    pub fn leading_eigen(&mut self, count: usize) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
        if count == 0 || count > self.dim {
            return Err(Error::config(format!(
                "eigenpair count {count} outside 1..={}",
                self.dim
            )));
        }
        if self.pending.len() >= 2 {
            self.fold();
        }
        if self.folds == 0 {
            return Err(Error::data("estimator has not folded any samples"));
        }
        let (values, vectors) = jacobi_eigen(&self.covariance, self.dim);
        let mut order: Vec<usize> = (0..self.dim).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
        let eigenvalues = order.iter().take(count).map(|&i| values[i]).collect();
        let eigenvectors = order
            .iter()
            .take(count)
            .map(|&i| (0..self.dim).map(|r| vectors[r * self.dim + i]).collect())
            .collect();
        Ok((eigenvalues, eigenvectors))
    }
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix. Returns the
/// eigenvalues and the eigenvector matrix (column `i` pairs with value
/// `i`), both unsorted.
fn jacobi_eigen(matrix: &[f64], dim: usize) -> (Vec<f64>, Vec<f64>) {
    let mut a = matrix.to_vec();
    let mut v = vec![0.0; dim * dim];
    for i in 0..dim {
        v[i * dim + i] = 1.0;
    }

    const MAX_SWEEPS: usize = 64;
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..dim {
            for q in (p + 1)..dim {
                off += a[p * dim + q] * a[p * dim + q];
            }
        }
        if off < 1e-24 {
            break;
        }
        for p in 0..dim {
            for q in (p + 1)..dim {
                let apq = a[p * dim + q];
                if apq.abs() < 1e-30 {
                    continue;
                }
                let theta = (a[q * dim + q] - a[p * dim + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..dim {
                    let akp = a[k * dim + p];
                    let akq = a[k * dim + q];
                    a[k * dim + p] = c * akp - s * akq;
                    a[k * dim + q] = s * akp + c * akq;
                }
                for k in 0..dim {
                    let apk = a[p * dim + k];
                    let aqk = a[q * dim + k];
                    a[p * dim + k] = c * apk - s * aqk;
                    a[q * dim + k] = s * apk + c * aqk;
                }
                for k in 0..dim {
                    let vkp = v[k * dim + p];
                    let vkq = v[k * dim + q];
                    v[k * dim + p] = c * vkp - s * vkq;
                    v[k * dim + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let values = (0..dim).map(|i| a[i * dim + i]).collect();
    (values, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn jacobi_recovers_known_spectrum() {
        // Eigenvalues of [[2,1],[1,2]] are 3 and 1.
        let (values, vectors) = jacobi_eigen(&[2.0, 1.0, 1.0, 2.0], 2);
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        assert_relative_eq!(sorted[0], 3.0, epsilon = 1e-9);
        assert_relative_eq!(sorted[1], 1.0, epsilon = 1e-9);

        // Leading eigenvector of 3 is (1,1)/sqrt(2), up to sign.
        let lead = values.iter().position(|&x| (x - 3.0).abs() < 1e-9).unwrap();
        let ratio = vectors[lead] / vectors[2 + lead];
        assert_relative_eq!(ratio, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn leading_direction_follows_the_data() {
        let mut est = PcaGradientEstimator::new(2, 8, 0.0).unwrap();
        // Variance overwhelmingly along the first axis.
        for i in 0..8 {
            let x = if i % 2 == 0 { 1.0 } else { -1.0 };
            est.observe(&[x, 0.01 * x]).unwrap();
        }
        let (values, vectors) = est.leading_eigen(2).unwrap();
        assert!(values[0] > values[1]);
        assert!(vectors[0][0].abs() > vectors[0][1].abs());
    }

    #[test]
    fn discount_keeps_history_alive() {
        let mut est = PcaGradientEstimator::new(1, 2, 0.5).unwrap();
        est.observe(&[1.0]).unwrap();
        est.observe(&[-1.0]).unwrap();
        let (v_first, _) = est.leading_eigen(1).unwrap();
        // A batch with no variance halves the estimate instead of zeroing
        // it.
        est.observe(&[0.0]).unwrap();
        est.observe(&[0.0]).unwrap();
        let (v_second, _) = est.leading_eigen(1).unwrap();
        assert_relative_eq!(v_second[0], v_first[0] / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut est = PcaGradientEstimator::new(3, 4, 0.0).unwrap();
        assert!(est.observe(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn eigen_before_any_fold_is_an_error() {
        let mut est = PcaGradientEstimator::new(2, 4, 0.0).unwrap();
        est.observe(&[1.0, 0.0]).unwrap();
        assert!(est.leading_eigen(1).is_err());
    }
}
