//! Loss criteria and their weighted concatenation.
//!
//! Every criterion scores a segment of a graph's output vector against a
//! target and exposes the gradient with respect to that segment. The
//! [`ConcatCriterion`] combines several criteria over disjoint segments of
//! one combined output vector, which is how joint phases mix the
//! supervised loss with per-layer reconstruction losses.

use ndarray::{Array1, ArrayView1};

use crate::error::{Error, Result};

/// Per-example target handed to a criterion.
#[derive(Clone, Copy)]
pub enum Target<'a> {
    /// Class index, for the negative-log-likelihood criterion.
    Class(usize),
    /// Dense target vector, for reconstruction criteria.
    Vector(ArrayView1<'a, f32>),
}

pub trait Criterion: Send {
    fn name(&self) -> &str;

    /// Width of the output segment this criterion scores.
    fn n_inputs(&self) -> usize;

    fn forward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<f32>;

    /// Compute the gradient with respect to `output`, readable through
    /// [`gradient`](Self::gradient) afterwards.
    fn backward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<()>;

    fn gradient(&self) -> ArrayView1<f32>;

    /// Invoked once per evaluation batch.
    fn reset(&mut self) {}
}

/// Half squared error, `0.5 * sum((o - t)^2)`.
pub struct MseCriterion {
    width: usize,
    gradient: Array1<f32>,
}

impl MseCriterion {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            gradient: Array1::zeros(width),
        }
    }

    fn vector_target<'a>(&self, target: Target<'a>) -> Result<ArrayView1<'a, f32>> {
        match target {
            Target::Vector(v) if v.len() == self.width => Ok(v),
            Target::Vector(v) => Err(Error::dimension(format!(
                "mse: target has {} values, expected {}",
                v.len(),
                self.width
            ))),
            Target::Class(_) => Err(Error::data("mse: expected a vector target")),
        }
    }
}

impl Criterion for MseCriterion {
    fn name(&self) -> &str {
        "mse"
    }

    fn n_inputs(&self) -> usize {
        self.width
    }

    fn forward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<f32> {
        let t = self.vector_target(target)?;
        let mut loss = 0.0;
        for (&o, &t) in output.iter().zip(t.iter()) {
            let d = o - t;
            loss += 0.5 * d * d;
        }
        Ok(loss)
    }

    fn backward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<()> {
        let t = self.vector_target(target)?;
        for ((g, &o), &t) in self.gradient.iter_mut().zip(output.iter()).zip(t.iter()) {
            *g = o - t;
        }
        Ok(())
    }

    fn gradient(&self) -> ArrayView1<f32> {
        self.gradient.view()
    }
}

/// Bernoulli cross-entropy over outputs in (0, 1). Pairs with sigmoid
/// reconstruction heads; the pairing is validated at configuration time.
pub struct CrossEntropyCriterion {
    width: usize,
    gradient: Array1<f32>,
}

const CE_EPS: f32 = 1e-7;

impl CrossEntropyCriterion {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            gradient: Array1::zeros(width),
        }
    }

    fn vector_target<'a>(&self, target: Target<'a>) -> Result<ArrayView1<'a, f32>> {
        match target {
            Target::Vector(v) if v.len() == self.width => Ok(v),
            Target::Vector(v) => Err(Error::dimension(format!(
                "cross-entropy: target has {} values, expected {}",
                v.len(),
                self.width
            ))),
            Target::Class(_) => Err(Error::data("cross-entropy: expected a vector target")),
        }
    }
}

impl Criterion for CrossEntropyCriterion {
    fn name(&self) -> &str {
        "cross-entropy"
    }

    fn n_inputs(&self) -> usize {
        self.width
    }

    fn forward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<f32> {
        let t = self.vector_target(target)?;
        let mut loss = 0.0;
        for (&o, &t) in output.iter().zip(t.iter()) {
            let o = o.clamp(CE_EPS, 1.0 - CE_EPS);
            loss -= t * o.ln() + (1.0 - t) * (1.0 - o).ln();
        }
        Ok(loss)
    }

    fn backward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<()> {
        let t = self.vector_target(target)?;
        for ((g, &o), &t) in self.gradient.iter_mut().zip(output.iter()).zip(t.iter()) {
            let o = o.clamp(CE_EPS, 1.0 - CE_EPS);
            *g = (o - t) / (o * (1.0 - o));
        }
        Ok(())
    }

    fn gradient(&self) -> ArrayView1<f32> {
        self.gradient.view()
    }
}

/// Negative log likelihood over log-probabilities, `-output[class]`.
pub struct ClassNllCriterion {
    width: usize,
    gradient: Array1<f32>,
}

impl ClassNllCriterion {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            gradient: Array1::zeros(width),
        }
    }

    fn class_target(&self, target: Target) -> Result<usize> {
        match target {
            Target::Class(c) if c < self.width => Ok(c),
            Target::Class(c) => Err(Error::data(format!(
                "nll: class {c} out of range for {} outputs",
                self.width
            ))),
            Target::Vector(_) => Err(Error::data("nll: expected a class target")),
        }
    }
}

impl Criterion for ClassNllCriterion {
    fn name(&self) -> &str {
        "nll"
    }

    fn n_inputs(&self) -> usize {
        self.width
    }

    fn forward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<f32> {
        let class = self.class_target(target)?;
        Ok(-output[class])
    }

    fn backward(&mut self, output: ArrayView1<f32>, target: Target) -> Result<()> {
        let class = self.class_target(target)?;
        let _ = output;
        self.gradient.fill(0.0);
        self.gradient[class] = -1.0;
        Ok(())
    }

    fn gradient(&self) -> ArrayView1<f32> {
        self.gradient.view()
    }
}

/// Weighted combination of criteria over disjoint segments of one output
/// vector: `loss = sum(w_i * C_i(segment_i))`, gradient the concatenation
/// of `w_i * grad(C_i)`.
pub struct ConcatCriterion {
    parts: Vec<ConcatPart>,
    gradient: Array1<f32>,
}

struct ConcatPart {
    criterion: Box<dyn Criterion>,
    weight: f32,
}

impl ConcatCriterion {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            gradient: Array1::zeros(0),
        }
    }

    pub fn push(&mut self, criterion: Box<dyn Criterion>, weight: f32) {
        self.parts.push(ConcatPart { criterion, weight });
        self.gradient = Array1::zeros(self.n_inputs());
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn n_inputs(&self) -> usize {
        self.parts.iter().map(|p| p.criterion.n_inputs()).sum()
    }

    pub fn weight(&self, index: usize) -> f32 {
        self.parts[index].weight
    }

    pub fn set_weight(&mut self, index: usize, weight: f32) {
        self.parts[index].weight = weight;
    }

    fn check_targets(&self, output: ArrayView1<f32>, targets: &[Target]) -> Result<()> {
        if targets.len() != self.parts.len() {
            return Err(Error::data(format!(
                "concat loss: {} targets for {} criteria",
                targets.len(),
                self.parts.len()
            )));
        }
        if output.len() != self.n_inputs() {
            return Err(Error::dimension(format!(
                "concat loss: output has {} values, expected {}",
                output.len(),
                self.n_inputs()
            )));
        }
        Ok(())
    }

    /// Range of the combined output vector covered by part `index`.
    pub fn segment(&self, index: usize) -> std::ops::Range<usize> {
        let start: usize = self
            .parts
            .iter()
            .take(index)
            .map(|p| p.criterion.n_inputs())
            .sum();
        start..start + self.parts[index].criterion.n_inputs()
    }

    /// Gradient of part `index` alone, unweighted, zero outside its
    /// segment. Used for gradient-variance estimation and profiling.
    pub fn backward_part(
        &mut self,
        index: usize,
        output: ArrayView1<f32>,
        target: Target,
    ) -> Result<()> {
        if index >= self.parts.len() {
            return Err(Error::data(format!(
                "concat loss: part {index} of {}",
                self.parts.len()
            )));
        }
        let range = self.segment(index);
        let part = &mut self.parts[index];
        part.criterion
            .backward(output.slice(ndarray::s![range.clone()]), target)?;
        self.gradient.fill(0.0);
        self.gradient
            .slice_mut(ndarray::s![range])
            .assign(&part.criterion.gradient());
        Ok(())
    }

    /// Weighted total loss over all segments.
    pub fn forward(&mut self, output: ArrayView1<f32>, targets: &[Target]) -> Result<f32> {
        self.check_targets(output, targets)?;
        let mut loss = 0.0;
        let mut offset = 0;
        for (part, &target) in self.parts.iter_mut().zip(targets.iter()) {
            let width = part.criterion.n_inputs();
            let segment = output.slice(ndarray::s![offset..offset + width]);
            loss += part.weight * part.criterion.forward(segment, target)?;
            offset += width;
        }
        Ok(loss)
    }

    pub fn backward(&mut self, output: ArrayView1<f32>, targets: &[Target]) -> Result<()> {
        self.check_targets(output, targets)?;
        let mut offset = 0;
        for (part, &target) in self.parts.iter_mut().zip(targets.iter()) {
            let width = part.criterion.n_inputs();
            let segment = output.slice(ndarray::s![offset..offset + width]);
            part.criterion.backward(segment, target)?;
            let mut dest = self
                .gradient
                .slice_mut(ndarray::s![offset..offset + width]);
            dest.assign(&part.criterion.gradient());
            dest *= part.weight;
            offset += width;
        }
        Ok(())
    }

    pub fn gradient(&self) -> ArrayView1<f32> {
        self.gradient.view()
    }

    pub fn reset(&mut self) {
        for part in self.parts.iter_mut() {
            part.criterion.reset();
        }
    }
}

impl Default for ConcatCriterion {
    fn default() -> Self {
        Self::new()
    }
}
