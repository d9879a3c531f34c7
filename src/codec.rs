//! Codec: linear transform plus nonlinearity as one gradient module.
//!
//! A codec acts as an encoder, a decoder or the classifier head of a
//! stacked topology. Variants: a fresh codec owning its weights; a tied
//! codec viewing its paired encoder's weights transposed; the corrupted
//! twin of an encoder, sharing the encoder's whole transform behind a
//! noise layer.

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;

use crate::error::Result;
use crate::module::{Corruption, GradientModule, Linear, Nonlinearity, ParamGroup};

pub struct Codec {
    name: String,
    corruption: Option<Corruption>,
    linear: Linear,
    activation: Nonlinearity,
    smoothed: bool,
    partial_backprop: bool,
    /// Input actually fed to the linear (post-corruption when noisy).
    linear_input: Array1<f32>,
    output: Array1<f32>,
    pre_grad: Array1<f32>,
    input_grad: Array1<f32>,
}

impl Codec {
    /// Fresh codec with its own weights.
    pub fn new(
        name: impl Into<String>,
        n_inputs: usize,
        n_outputs: usize,
        activation: Nonlinearity,
        smoothed: bool,
        rng: &mut StdRng,
    ) -> Self {
        let name = name.into();
        let linear = Linear::new(&name, n_inputs, n_outputs, rng);
        Self {
            name,
            corruption: None,
            linear,
            activation,
            smoothed,
            partial_backprop: false,
            linear_input: Array1::zeros(n_inputs),
            output: Array1::zeros(n_outputs),
            pre_grad: Array1::zeros(n_outputs),
            input_grad: Array1::zeros(n_inputs),
        }
    }

    /// Decoder tied to `encoder`: weights are the transpose view of the
    /// encoder's storage, never an independent copy.
    pub fn tied(
        name: impl Into<String>,
        encoder: &Codec,
        activation: Nonlinearity,
        reparametrize: bool,
        rng: &mut StdRng,
    ) -> Self {
        let name = name.into();
        let linear = Linear::transposed_view(&name, &encoder.linear, reparametrize, rng);
        let (n_inputs, n_outputs) = (linear.n_inputs(), linear.n_outputs());
        Self {
            name,
            corruption: None,
            linear,
            activation,
            smoothed: false,
            partial_backprop: false,
            linear_input: Array1::zeros(n_inputs),
            output: Array1::zeros(n_outputs),
            pre_grad: Array1::zeros(n_outputs),
            input_grad: Array1::zeros(n_inputs),
        }
    }

    /// Corrupted twin of `encoder`: the same transform (same weights and
    /// bias) applied to a noise-corrupted input.
    pub fn corrupted_twin(
        name: impl Into<String>,
        encoder: &Codec,
        activation: Nonlinearity,
        noise_seed: u64,
    ) -> Self {
        let name = name.into();
        let linear = Linear::shared_view(&name, &encoder.linear);
        let (n_inputs, n_outputs) = (linear.n_inputs(), linear.n_outputs());
        Self {
            name,
            corruption: Some(Corruption::new(n_inputs, noise_seed)),
            linear,
            activation,
            smoothed: false,
            partial_backprop: false,
            linear_input: Array1::zeros(n_inputs),
            output: Array1::zeros(n_outputs),
            pre_grad: Array1::zeros(n_outputs),
            input_grad: Array1::zeros(n_inputs),
        }
    }

    pub fn activation(&self) -> Nonlinearity {
        self.activation
    }

    /// Whether the first-layer smoothing penalty applies to this codec.
    pub fn is_smoothed(&self) -> bool {
        self.smoothed
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    pub fn linear_mut(&mut self) -> &mut Linear {
        &mut self.linear
    }

    /// Corruption options, when this codec is a corrupted twin.
    pub fn set_corruption_options(&mut self, probability: f32, value: f32) {
        if let Some(c) = self.corruption.as_mut() {
            c.set_options(probability, value);
        }
    }
}

impl GradientModule for Codec {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_inputs(&self) -> usize {
        self.linear.n_inputs()
    }

    fn n_outputs(&self) -> usize {
        self.linear.n_outputs()
    }

    fn forward(&mut self, input: ArrayView1<f32>) -> Result<()> {
        match self.corruption.as_mut() {
            Some(c) => {
                c.forward(input);
                self.linear_input.assign(&c.output());
            }
            None => self.linear_input.assign(&input),
        }
        self.linear.forward(self.linear_input.view());
        self.activation.forward(self.linear.output(), &mut self.output);
        Ok(())
    }

    fn output(&self) -> ArrayView1<f32> {
        self.output.view()
    }

    fn backward(&mut self, _input: ArrayView1<f32>, output_grad: ArrayView1<f32>) -> Result<()> {
        self.activation
            .backward(self.output.view(), output_grad, &mut self.pre_grad);
        self.linear.backward(self.linear_input.view(), self.pre_grad.view());
        match self.corruption.as_mut() {
            Some(c) => {
                c.backward(self.linear.input_grad());
                self.input_grad.assign(&c.input_grad());
            }
            None => self.input_grad.assign(&self.linear.input_grad()),
        }
        Ok(())
    }

    fn input_grad(&self) -> ArrayView1<f32> {
        self.input_grad.view()
    }

    fn set_partial_backprop(&mut self, enabled: bool) {
        self.partial_backprop = enabled;
    }

    fn partial_backprop(&self) -> bool {
        self.partial_backprop
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        self.linear.param_groups()
    }
}
