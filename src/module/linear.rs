//! Linear transform over shared flat parameter storage.
//!
//! A `Linear` either owns its weights, views another linear's weights
//! transposed (tied decoder), or views them identically (the corrupted twin
//! of an encoder, which also shares the bias). Views never copy; gradient
//! accumulation lands in the shared buffers and deduplication by storage
//! identity makes updates apply exactly once.

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::Rng;

use super::ParamGroup;

pub struct Linear {
    name: String,
    n_inputs: usize,
    n_outputs: usize,
    /// Stored in the owner's orientation: (owner outputs × owner inputs),
    /// row-major. For a transposed view the owner's outputs are this
    /// module's inputs.
    weights: ParamGroup,
    bias: ParamGroup,
    transposed: bool,
    owns_weights: bool,
    /// Additive adjustment on the shared weights (reparametrized tying),
    /// stored in this module's orientation.
    adjustment: Option<ParamGroup>,
    l1_decay: f32,
    l2_decay: f32,
    bias_decay: f32,
    /// (l1, l2) smoothing decay across adjacent input weights.
    smoothing_decay: Option<(f32, f32)>,
    output: Array1<f32>,
    input_grad: Array1<f32>,
}

impl Linear {
    /// Fresh linear with uniform ±1/sqrt(fan-in) initialization.
    pub fn new(name: impl Into<String>, n_inputs: usize, n_outputs: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (n_inputs as f32).sqrt();
        let weights: Vec<f32> = (0..n_outputs * n_inputs)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        let bias: Vec<f32> = (0..n_outputs).map(|_| rng.random_range(-bound..bound)).collect();
        let name = name.into();
        Self {
            weights: ParamGroup::new(format!("{name}.weights"), weights),
            bias: ParamGroup::new(format!("{name}.bias"), bias),
            name,
            n_inputs,
            n_outputs,
            transposed: false,
            owns_weights: true,
            adjustment: None,
            l1_decay: 0.0,
            l2_decay: 0.0,
            bias_decay: 0.0,
            smoothing_decay: None,
            output: Array1::zeros(n_outputs),
            input_grad: Array1::zeros(n_inputs),
        }
    }

    /// Transposed view over `owner`'s weights, with a fresh bias. With
    /// `reparametrize` an owned additive adjustment is layered on the
    /// shared weights; the shared storage itself is never written here.
    pub fn transposed_view(
        name: impl Into<String>,
        owner: &Linear,
        reparametrize: bool,
        rng: &mut StdRng,
    ) -> Self {
        let n_inputs = owner.n_outputs;
        let n_outputs = owner.n_inputs;
        let bound = 1.0 / (n_inputs as f32).sqrt();
        let bias: Vec<f32> = (0..n_outputs).map(|_| rng.random_range(-bound..bound)).collect();
        let name = name.into();
        let adjustment = reparametrize
            .then(|| ParamGroup::new(format!("{name}.adjustment"), vec![0.0; n_outputs * n_inputs]));
        Self {
            weights: owner.weights.clone(),
            bias: ParamGroup::new(format!("{name}.bias"), bias),
            name,
            n_inputs,
            n_outputs,
            transposed: true,
            owns_weights: false,
            adjustment,
            l1_decay: 0.0,
            l2_decay: 0.0,
            bias_decay: 0.0,
            smoothing_decay: None,
            output: Array1::zeros(n_outputs),
            input_grad: Array1::zeros(n_inputs),
        }
    }

    /// Identical view over `owner`: same weights and same bias. Used for
    /// the corrupted twin of an encoder, which is the same transform fed
    /// through a corruption layer.
    pub fn shared_view(name: impl Into<String>, owner: &Linear) -> Self {
        Self {
            weights: owner.weights.clone(),
            bias: owner.bias.clone(),
            name: name.into(),
            n_inputs: owner.n_inputs,
            n_outputs: owner.n_outputs,
            transposed: false,
            owns_weights: false,
            adjustment: None,
            l1_decay: 0.0,
            l2_decay: 0.0,
            bias_decay: 0.0,
            smoothing_decay: None,
            output: Array1::zeros(owner.n_outputs),
            input_grad: Array1::zeros(owner.n_inputs),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Whether this linear owns its weight storage.
    pub fn owns_weights(&self) -> bool {
        self.owns_weights
    }

    pub fn set_weight_decay(&mut self, l1: f32, l2: f32) {
        self.l1_decay = l1;
        self.l2_decay = l2;
    }

    pub fn set_bias_decay(&mut self, decay: f32) {
        self.bias_decay = decay;
    }

    pub fn set_smoothing_decay(&mut self, l1: f32, l2: f32) {
        self.smoothing_decay = Some((l1, l2));
    }

    /// Flat index of this module's weight (row = output, col = input) in
    /// the shared, owner-oriented storage.
    #[inline]
    fn widx(&self, row: usize, col: usize) -> usize {
        if self.transposed {
            // owner shape is (n_inputs, n_outputs)
            col * self.n_outputs + row
        } else {
            row * self.n_inputs + col
        }
    }

    #[inline]
    fn weight_at(&self, shared: &[f32], adj: Option<&[f32]>, row: usize, col: usize) -> f32 {
        let mut w = shared[self.widx(row, col)];
        if let Some(adj) = adj {
            w += adj[row * self.n_inputs + col];
        }
        w
    }

    pub fn forward(&mut self, input: ArrayView1<f32>) {
        let shared = self.weights.data();
        let adj_guard = self.adjustment.as_ref().map(|a| a.data());
        let adj = adj_guard.as_deref().map(|v| v.as_slice());
        let bias = self.bias.data();
        for row in 0..self.n_outputs {
            let mut acc = bias[row];
            for (col, &x) in input.iter().enumerate() {
                acc += self.weight_at(&shared, adj, row, col) * x;
            }
            self.output[row] = acc;
        }
    }

    pub fn backward(&mut self, input: ArrayView1<f32>, output_grad: ArrayView1<f32>) {
        // Parameter gradients.
        {
            let mut wg = self.weights.grad_mut();
            let mut ag = self.adjustment.as_ref().map(|a| a.grad_mut());
            for (row, &g) in output_grad.iter().enumerate() {
                for (col, &x) in input.iter().enumerate() {
                    wg[self.widx(row, col)] += g * x;
                    if let Some(ag) = ag.as_deref_mut() {
                        ag[row * self.n_inputs + col] += g * x;
                    }
                }
            }
        }
        {
            let bias = self.bias.data();
            let mut bg = self.bias.grad_mut();
            for (row, &g) in output_grad.iter().enumerate() {
                bg[row] += g;
                if self.bias_decay > 0.0 {
                    bg[row] += self.bias_decay * bias[row];
                }
            }
        }
        self.apply_decay();

        // Input gradient.
        let shared = self.weights.data();
        let adj_guard = self.adjustment.as_ref().map(|a| a.data());
        let adj = adj_guard.as_deref().map(|v| v.as_slice());
        for col in 0..self.n_inputs {
            let mut acc = 0.0;
            for (row, &g) in output_grad.iter().enumerate() {
                acc += self.weight_at(&shared, adj, row, col) * g;
            }
            self.input_grad[col] = acc;
        }
    }

    fn apply_decay(&mut self) {
        if self.l1_decay == 0.0 && self.l2_decay == 0.0 && self.smoothing_decay.is_none() {
            return;
        }
        let data = self.weights.data();
        let mut grad = self.weights.grad_mut();
        if self.l1_decay > 0.0 || self.l2_decay > 0.0 {
            for (g, &w) in grad.iter_mut().zip(data.iter()) {
                *g += self.l2_decay * w + self.l1_decay * w.signum();
            }
        }
        if let Some((l1s, l2s)) = self.smoothing_decay {
            // Penalize differences between weights on adjacent inputs,
            // row by row. Only meaningful for owned, non-transposed
            // storage (the smoothed first-layer encoder).
            for row in 0..self.n_outputs {
                for col in 0..self.n_inputs {
                    let w = data[self.widx(row, col)];
                    let mut g = 0.0;
                    if col > 0 {
                        let d = w - data[self.widx(row, col - 1)];
                        g += l2s * d + l1s * d.signum();
                    }
                    if col + 1 < self.n_inputs {
                        let d = w - data[self.widx(row, col + 1)];
                        g += l2s * d + l1s * d.signum();
                    }
                    grad[self.widx(row, col)] += g;
                }
            }
        }
    }

    pub fn output(&self) -> ArrayView1<f32> {
        self.output.view()
    }

    pub fn input_grad(&self) -> ArrayView1<f32> {
        self.input_grad.view()
    }

    /// Parameter groups this linear touches, in a stable order.
    pub fn param_groups(&self) -> Vec<ParamGroup> {
        let mut groups = vec![self.weights.clone(), self.bias.clone()];
        if let Some(adj) = &self.adjustment {
            groups.push(adj.clone());
        }
        groups
    }

    /// The shared weight group (for tests and tying assertions).
    pub fn weights(&self) -> &ParamGroup {
        &self.weights
    }

    /// The bias group.
    pub fn bias(&self) -> &ParamGroup {
        &self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn forward_matches_manual_product() {
        let mut lin = Linear::new("l", 2, 2, &mut rng());
        lin.weights.data_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        lin.bias.data_mut().copy_from_slice(&[0.5, -0.5]);
        lin.forward(array![1.0, 1.0].view());
        assert_relative_eq!(lin.output()[0], 3.5);
        assert_relative_eq!(lin.output()[1], 6.5);
    }

    #[test]
    fn transposed_view_reads_owner_storage_live() {
        let mut r = rng();
        let enc = Linear::new("enc", 2, 3, &mut r);
        let mut dec = Linear::transposed_view("dec", &enc, false, &mut r);
        assert_eq!(dec.n_inputs(), 3);
        assert_eq!(dec.n_outputs(), 2);

        // Mutate the owner's storage and observe it through the view with
        // no copy lag.
        enc.weights.data_mut().copy_from_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        dec.bias.data_mut().copy_from_slice(&[0.0, 0.0]);
        dec.forward(array![1.0, 1.0, 1.0].view());
        // W^T x with owner W = [[1,0],[0,1],[1,1]]
        assert_relative_eq!(dec.output()[0], 2.0);
        assert_relative_eq!(dec.output()[1], 2.0);
    }

    #[test]
    fn backward_accumulates_outer_product() {
        let mut lin = Linear::new("l", 2, 1, &mut rng());
        lin.weights.data_mut().copy_from_slice(&[1.0, -1.0]);
        lin.weights.zero_grad();
        lin.bias.zero_grad();
        lin.forward(array![2.0, 3.0].view());
        lin.backward(array![2.0, 3.0].view(), array![1.0].view());
        assert_eq!(*lin.weights.grad(), vec![2.0, 3.0]);
        assert_eq!(*lin.bias.grad(), vec![1.0]);
        assert_relative_eq!(lin.input_grad()[0], 1.0);
        assert_relative_eq!(lin.input_grad()[1], -1.0);
    }

    #[test]
    fn tied_backward_accumulates_into_shared_grad() {
        let mut r = rng();
        let enc = Linear::new("enc", 2, 1, &mut r);
        let mut dec = Linear::transposed_view("dec", &enc, false, &mut r);
        enc.weights.zero_grad();
        dec.forward(array![1.0].view());
        dec.backward(array![1.0].view(), array![1.0, 1.0].view());
        // Gradient landed in the single shared buffer.
        let g = enc.weights.grad();
        assert_eq!(g.len(), 2);
        assert!(g.iter().all(|&v| v != 0.0));
    }

    #[test]
    fn l2_decay_contributes_to_gradient() {
        let mut lin = Linear::new("l", 1, 1, &mut rng());
        lin.weights.data_mut().copy_from_slice(&[2.0]);
        lin.weights.zero_grad();
        lin.bias.zero_grad();
        lin.set_weight_decay(0.0, 0.1);
        lin.forward(array![0.0].view());
        lin.backward(array![0.0].view(), array![0.0].view());
        assert_relative_eq!(lin.weights.grad()[0], 0.2);
    }
}
