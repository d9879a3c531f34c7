//! Gradient-module substrate
//!
//! Every unit that participates in a computation graph implements
//! [`GradientModule`]: a synchronous forward/backward contract with stored
//! output and input-gradient buffers, and parameter storage exposed as a
//! flat list of shared [`ParamGroup`]s. Modules are shared between graph
//! views through [`ModuleHandle`]s, so the same parameters can participate
//! in several overlapping graphs without copies.

pub mod activation;
pub mod identity;
pub mod linear;
pub mod noise;

use std::sync::Arc;

use ndarray::ArrayView1;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;

pub use activation::Nonlinearity;
pub use identity::Identity;
pub use linear::Linear;
pub use noise::Corruption;

/// Shared handle to a module, used by graphs and the trainer.
///
/// All graph views over a topology alias modules through these handles;
/// only one graph runs forward/backward at a time (the trainer serializes
/// phases), the lock is the sharing mechanism rather than a concurrency
/// feature.
pub type ModuleHandle = Arc<RwLock<dyn GradientModule>>;

/// A named, shared group of parameters with its gradient accumulator.
///
/// Data and gradient are flat buffers behind shared ownership. Two modules
/// holding clones of the same group alias the same storage; deduplication
/// (for updates, gradient clearing, persistence) is by storage identity,
/// see [`ParamGroup::key`].
#[derive(Clone)]
pub struct ParamGroup {
    name: String,
    data: Arc<RwLock<Vec<f32>>>,
    grad: Arc<RwLock<Vec<f32>>>,
}

impl ParamGroup {
    /// Create a new group owning `init` as its parameter values.
    pub fn new(name: impl Into<String>, init: Vec<f32>) -> Self {
        let grad = vec![0.0; init.len()];
        Self {
            name: name.into(),
            data: Arc::new(RwLock::new(init)),
            grad: Arc::new(RwLock::new(grad)),
        }
    }

    /// Group name (diagnostic only; identity is [`ParamGroup::key`]).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parameters in the group.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Identity key of the underlying storage. Clones of the same group
    /// share the key; independent groups never do.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.data) as *const () as usize
    }

    /// Read access to the parameter values.
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read()
    }

    /// Write access to the parameter values.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write()
    }

    /// Read access to the gradient accumulator.
    pub fn grad(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.grad.read()
    }

    /// Write access to the gradient accumulator.
    pub fn grad_mut(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.grad.write()
    }

    /// Zero the gradient accumulator.
    pub fn zero_grad(&self) {
        for g in self.grad.write().iter_mut() {
            *g = 0.0;
        }
    }

    /// Apply one gradient-descent step: `data -= rate * grad`.
    pub fn apply_step(&self, rate: f32) {
        let grad = self.grad.read();
        let mut data = self.data.write();
        for (p, g) in data.iter_mut().zip(grad.iter()) {
            *p -= rate * g;
        }
    }
}

/// Deduplicate a parameter-group list by storage identity, preserving the
/// first occurrence order.
pub fn unique_groups(groups: Vec<ParamGroup>) -> Vec<ParamGroup> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(groups.len());
    for g in groups {
        if seen.insert(g.key()) {
            out.push(g);
        }
    }
    out
}

/// Forward/backward contract every graph participant implements.
///
/// A module owns its output buffer and its input-gradient buffer; `forward`
/// and `backward` fill them. `backward` additionally accumulates into the
/// module's parameter gradients (never resetting them; the trainer zeroes
/// gradients explicitly before each example).
pub trait GradientModule: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Input width.
    fn n_inputs(&self) -> usize;

    /// Output width.
    fn n_outputs(&self) -> usize;

    /// Compute the output for `input`, storing it in the output buffer.
    fn forward(&mut self, input: ArrayView1<f32>) -> Result<()>;

    /// Output of the last `forward` call.
    fn output(&self) -> ArrayView1<f32>;

    /// Given the same `input` as the preceding `forward` and the gradient
    /// of the loss with respect to the output, accumulate parameter
    /// gradients and store the gradient with respect to the input.
    fn backward(&mut self, input: ArrayView1<f32>, output_grad: ArrayView1<f32>) -> Result<()>;

    /// Input gradient stored by the last `backward` call.
    fn input_grad(&self) -> ArrayView1<f32>;

    /// Set the partial-backprop switch. A module flagged partial computes
    /// and stores its input gradient as usual, but a containing graph will
    /// not propagate that gradient to the module's producer.
    fn set_partial_backprop(&mut self, _enabled: bool) {}

    /// Current partial-backprop state.
    fn partial_backprop(&self) -> bool {
        false
    }

    /// Parameter groups touched by this module, owners and views alike.
    /// Callers deduplicate with [`unique_groups`].
    fn param_groups(&self) -> Vec<ParamGroup> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_group_clone_aliases_storage() {
        let a = ParamGroup::new("w", vec![1.0, 2.0]);
        let b = a.clone();
        assert_eq!(a.key(), b.key());
        b.data_mut()[0] = 5.0;
        assert_eq!(a.data()[0], 5.0);
    }

    #[test]
    fn independent_groups_have_distinct_keys() {
        let a = ParamGroup::new("w", vec![1.0]);
        let b = ParamGroup::new("w", vec![1.0]);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn apply_step_descends() {
        let g = ParamGroup::new("w", vec![1.0, -1.0]);
        g.grad_mut().copy_from_slice(&[0.5, 0.5]);
        g.apply_step(2.0);
        assert_eq!(*g.data(), vec![0.0, -2.0]);
    }

    #[test]
    fn unique_groups_dedupes_by_identity() {
        let a = ParamGroup::new("w", vec![1.0]);
        let b = ParamGroup::new("b", vec![1.0]);
        let out = unique_groups(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key(), a.key());
        assert_eq!(out[1].key(), b.key());
    }
}
