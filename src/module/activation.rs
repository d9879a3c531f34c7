//! Nonlinearity kinds applied by codecs after their linear transform.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Supported nonlinearities.
///
/// `LogSoftmax` is reserved for the classifier codec; the hidden-layer
/// kinds are `Sigmoid`, `Tanh` and `Linear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nonlinearity {
    /// Logistic sigmoid, output in (0, 1).
    Sigmoid,
    /// Hyperbolic tangent, output in (-1, 1).
    Tanh,
    /// Identity transfer.
    Linear,
    /// Log-softmax over the output vector.
    LogSoftmax,
}

impl Nonlinearity {
    /// Whether outputs lie in [0, 1], a requirement for cross-entropy
    /// reconstruction costs.
    pub fn bounded_unit(&self) -> bool {
        matches!(self, Nonlinearity::Sigmoid)
    }

    /// Apply the nonlinearity to `pre`, writing into `out`.
    pub fn forward(&self, pre: ArrayView1<f32>, out: &mut Array1<f32>) {
        match self {
            Nonlinearity::Sigmoid => {
                for (o, &x) in out.iter_mut().zip(pre.iter()) {
                    *o = 1.0 / (1.0 + (-x).exp());
                }
            }
            Nonlinearity::Tanh => {
                for (o, &x) in out.iter_mut().zip(pre.iter()) {
                    *o = x.tanh();
                }
            }
            Nonlinearity::Linear => out.assign(&pre),
            Nonlinearity::LogSoftmax => {
                let max = pre.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let log_sum = pre.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
                for (o, &x) in out.iter_mut().zip(pre.iter()) {
                    *o = x - log_sum;
                }
            }
        }
    }

    /// Gradient with respect to the pre-activation, expressed through the
    /// activation output `y` and the output gradient `grad`.
    pub fn backward(
        &self,
        y: ArrayView1<f32>,
        grad: ArrayView1<f32>,
        pre_grad: &mut Array1<f32>,
    ) {
        match self {
            Nonlinearity::Sigmoid => {
                for ((d, &o), &g) in pre_grad.iter_mut().zip(y.iter()).zip(grad.iter()) {
                    *d = g * o * (1.0 - o);
                }
            }
            Nonlinearity::Tanh => {
                for ((d, &o), &g) in pre_grad.iter_mut().zip(y.iter()).zip(grad.iter()) {
                    *d = g * (1.0 - o * o);
                }
            }
            Nonlinearity::Linear => pre_grad.assign(&grad),
            Nonlinearity::LogSoftmax => {
                // d pre_i = g_i - softmax_i * sum(g)
                let grad_sum: f32 = grad.iter().sum();
                for ((d, &o), &g) in pre_grad.iter_mut().zip(y.iter()).zip(grad.iter()) {
                    *d = g - o.exp() * grad_sum;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn sigmoid_forward_and_backward() {
        let pre = array![0.0, 2.0];
        let mut out = Array1::zeros(2);
        Nonlinearity::Sigmoid.forward(pre.view(), &mut out);
        assert_relative_eq!(out[0], 0.5);

        let grad = array![1.0, 1.0];
        let mut pre_grad = Array1::zeros(2);
        Nonlinearity::Sigmoid.backward(out.view(), grad.view(), &mut pre_grad);
        assert_relative_eq!(pre_grad[0], 0.25);
    }

    #[test]
    fn log_softmax_normalizes() {
        let pre = array![1.0, 2.0, 3.0];
        let mut out = Array1::zeros(3);
        Nonlinearity::LogSoftmax.forward(pre.view(), &mut out);
        let total: f32 = out.iter().map(|&x| x.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn log_softmax_backward_matches_finite_difference() {
        let pre = array![0.3, -0.7, 1.1];
        let mut y = Array1::zeros(3);
        Nonlinearity::LogSoftmax.forward(pre.view(), &mut y);

        // loss = -y[1] (class NLL shape), so grad is -1 at index 1
        let grad = array![0.0, -1.0, 0.0];
        let mut pre_grad = Array1::zeros(3);
        Nonlinearity::LogSoftmax.backward(y.view(), grad.view(), &mut pre_grad);

        let eps = 1e-3_f32;
        for i in 0..3 {
            let mut shifted = pre.clone();
            shifted[i] += eps;
            let mut y_plus = Array1::zeros(3);
            Nonlinearity::LogSoftmax.forward(shifted.view(), &mut y_plus);
            shifted[i] -= 2.0 * eps;
            let mut y_minus = Array1::zeros(3);
            Nonlinearity::LogSoftmax.forward(shifted.view(), &mut y_minus);
            let numeric = (-y_plus[1] + y_minus[1]) / (2.0 * eps);
            assert_relative_eq!(pre_grad[i], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn tanh_backward_uses_output() {
        let y = array![0.5];
        let grad = array![2.0];
        let mut pre_grad = Array1::zeros(1);
        Nonlinearity::Tanh.backward(y.view(), grad.view(), &mut pre_grad);
        assert_relative_eq!(pre_grad[0], 2.0 * (1.0 - 0.25));
    }
}
