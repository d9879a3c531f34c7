//! Parameterless pass-through module.
//!
//! Exists as a connection anchor: in noisy mode the first layer's
//! reconstruction branch cannot be connected to the raw external input, so
//! it connects to this module instead.

use ndarray::{Array1, ArrayView1};

use crate::error::Result;

use super::GradientModule;

pub struct Identity {
    name: String,
    width: usize,
    output: Array1<f32>,
    input_grad: Array1<f32>,
    partial_backprop: bool,
}

impl Identity {
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            width,
            output: Array1::zeros(width),
            input_grad: Array1::zeros(width),
            partial_backprop: false,
        }
    }
}

impl GradientModule for Identity {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_inputs(&self) -> usize {
        self.width
    }

    fn n_outputs(&self) -> usize {
        self.width
    }

    fn forward(&mut self, input: ArrayView1<f32>) -> Result<()> {
        self.output.assign(&input);
        Ok(())
    }

    fn output(&self) -> ArrayView1<f32> {
        self.output.view()
    }

    fn backward(&mut self, _input: ArrayView1<f32>, output_grad: ArrayView1<f32>) -> Result<()> {
        self.input_grad.assign(&output_grad);
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
}
