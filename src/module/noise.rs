//! Input corruption for denoising pretraining.
//!
//! Each forward pass independently replaces every coordinate with a fixed
//! value with the configured probability. The gradient passes only through
//! the surviving coordinates.

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct Corruption {
    probability: f32,
    value: f32,
    rng: StdRng,
    mask: Vec<bool>,
    output: Array1<f32>,
    input_grad: Array1<f32>,
}

impl Corruption {
    pub fn new(width: usize, seed: u64) -> Self {
        Self {
            probability: 0.0,
            value: 0.0,
            rng: StdRng::seed_from_u64(seed),
            mask: vec![false; width],
            output: Array1::zeros(width),
            input_grad: Array1::zeros(width),
        }
    }

    /// Set corruption probability and replacement value.
    pub fn set_options(&mut self, probability: f32, value: f32) {
        self.probability = probability;
        self.value = value;
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn forward(&mut self, input: ArrayView1<f32>) {
        for (i, &x) in input.iter().enumerate() {
            let corrupt = self.probability > 0.0 && self.rng.random::<f32>() < self.probability;
            self.mask[i] = corrupt;
            self.output[i] = if corrupt { self.value } else { x };
        }
    }

    pub fn backward(&mut self, output_grad: ArrayView1<f32>) {
        for (i, &g) in output_grad.iter().enumerate() {
            self.input_grad[i] = if self.mask[i] { 0.0 } else { g };
        }
    }

    pub fn output(&self) -> ArrayView1<f32> {
        self.output.view()
    }

    pub fn input_grad(&self) -> ArrayView1<f32> {
        self.input_grad.view()
    }
}
