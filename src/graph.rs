//! Layered computation graph over gradient modules.
//!
//! Modules are registered as nodes, wired with directed connections and
//! grouped into layers that fix the forward evaluation order. A node with
//! no incoming connections reads the external input; a node with several
//! producers reads their concatenated outputs. The graph itself implements
//! [`GradientModule`], so a built graph can be nested as a node inside a
//! larger one.

use std::collections::HashSet;

use ndarray::{Array1, ArrayView1};

use crate::error::{Error, Result};
use crate::module::{unique_groups, GradientModule, ModuleHandle, ParamGroup};

/// Node handle returned by [`ComputationGraph::add_module`].
pub type NodeId = usize;

struct Node {
    module: ModuleHandle,
    name: String,
    n_inputs: usize,
    n_outputs: usize,
    producers: Vec<NodeId>,
    layer: Option<usize>,
}

pub struct ComputationGraph {
    name: String,
    nodes: Vec<Node>,
    layers: Vec<Vec<NodeId>>,
    built: bool,
    n_inputs: usize,
    n_outputs: usize,
    output_nodes: Vec<NodeId>,
    /// Per-node input vector captured during forward, reused by backward.
    inputs: Vec<Array1<f32>>,
    /// Per-node accumulated output gradient.
    grads: Vec<Array1<f32>>,
    output: Array1<f32>,
    input_grad: Array1<f32>,
    partial_backprop: bool,
}

impl ComputationGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            layers: Vec::new(),
            built: false,
            n_inputs: 0,
            n_outputs: 0,
            output_nodes: Vec::new(),
            inputs: Vec::new(),
            grads: Vec::new(),
            output: Array1::zeros(0),
            input_grad: Array1::zeros(0),
            partial_backprop: false,
        }
    }

    /// Register a module as a node. Layer membership is assigned later
    /// through [`add_layer`](Self::add_layer).
    pub fn add_module(&mut self, module: ModuleHandle) -> NodeId {
        let (name, n_inputs, n_outputs) = {
            let m = module.read();
            (m.name().to_string(), m.n_inputs(), m.n_outputs())
        };
        self.nodes.push(Node {
            module,
            name,
            n_inputs,
            n_outputs,
            producers: Vec::new(),
            layer: None,
        });
        self.nodes.len() - 1
    }

    /// Wire `producer`'s output into `consumer`'s input. A consumer with
    /// several producers reads their outputs concatenated in connection
    /// order.
    pub fn connect(&mut self, producer: NodeId, consumer: NodeId) -> Result<()> {
        if self.built {
            return Err(Error::graph(format!(
                "{}: cannot connect after build",
                self.name
            )));
        }
        if producer >= self.nodes.len() || consumer >= self.nodes.len() {
            return Err(Error::graph(format!(
                "{}: connection references unknown node",
                self.name
            )));
        }
        if producer == consumer {
            return Err(Error::graph(format!(
                "{}: node {} cannot feed itself",
                self.name, self.nodes[consumer].name
            )));
        }
        self.nodes[consumer].producers.push(producer);
        Ok(())
    }

    /// Append an evaluation layer. Layers run in insertion order during
    /// forward and in reverse during backward.
    pub fn add_layer(&mut self, members: &[NodeId]) -> Result<()> {
        if self.built {
            return Err(Error::graph(format!(
                "{}: cannot add layer after build",
                self.name
            )));
        }
        let layer_index = self.layers.len();
        for &id in members {
            let node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::graph(format!("{}: unknown node {id}", self.name)))?;
            if let Some(existing) = node.layer {
                return Err(Error::graph(format!(
                    "{}: node {} already in layer {existing}",
                    self.name, node.name
                )));
            }
            node.layer = Some(layer_index);
        }
        self.layers.push(members.to_vec());
        Ok(())
    }

    /// Finalize the wiring: validate widths and producer ordering, resolve
    /// the output layer and allocate the working buffers. Building twice is
    /// an error.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Err(Error::graph(format!("{}: already built", self.name)));
        }
        if self.nodes.is_empty() {
            return Err(Error::graph(format!("{}: no modules", self.name)));
        }

        let mut input_width = None;
        for node in self.nodes.iter() {
            let layer = node.layer.ok_or_else(|| {
                Error::graph(format!(
                    "{}: node {} assigned to no layer",
                    self.name, node.name
                ))
            })?;
            if node.producers.is_empty() {
                match input_width {
                    None => input_width = Some(node.n_inputs),
                    Some(w) if w == node.n_inputs => {}
                    Some(w) => {
                        return Err(Error::dimension(format!(
                            "{}: input node {} expects {} values, others expect {w}",
                            self.name, node.name, node.n_inputs
                        )))
                    }
                }
            } else {
                let mut total = 0;
                for &p in &node.producers {
                    let producer = &self.nodes[p];
                    let producer_layer = producer.layer.ok_or_else(|| {
                        Error::graph(format!(
                            "{}: node {} assigned to no layer",
                            self.name, producer.name
                        ))
                    })?;
                    if producer_layer >= layer {
                        return Err(Error::graph(format!(
                            "{}: {} (layer {producer_layer}) cannot feed {} (layer {layer})",
                            self.name, producer.name, node.name
                        )));
                    }
                    total += producer.n_outputs;
                }
                if total != node.n_inputs {
                    return Err(Error::dimension(format!(
                        "{}: node {} expects {} inputs, producers supply {total}",
                        self.name, node.name, node.n_inputs
                    )));
                }
            }
        }

        self.output_nodes = self
            .layers
            .iter()
            .rev()
            .find(|layer| !layer.is_empty())
            .cloned()
            .ok_or_else(|| Error::graph(format!("{}: all layers empty", self.name)))?;

        self.n_inputs = input_width
            .ok_or_else(|| Error::graph(format!("{}: no input nodes", self.name)))?;
        self.n_outputs = self
            .output_nodes
            .iter()
            .map(|&id| self.nodes[id].n_outputs)
            .sum();

        self.inputs = self
            .nodes
            .iter()
            .map(|n| Array1::zeros(n.n_inputs))
            .collect();
        self.grads = self
            .nodes
            .iter()
            .map(|n| Array1::zeros(n.n_outputs))
            .collect();
        self.output = Array1::zeros(self.n_outputs);
        self.input_grad = Array1::zeros(self.n_inputs);
        self.built = true;
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The module behind a node.
    pub fn module(&self, id: NodeId) -> Option<ModuleHandle> {
        self.nodes.get(id).map(|n| n.module.clone())
    }

    /// A node's output as captured by the last forward pass.
    pub fn node_output(&self, id: NodeId) -> Result<Array1<f32>> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::graph(format!("{}: unknown node {id}", self.name)))?;
        Ok(node.module.read().output().to_owned())
    }

    /// The nodes producing the graph output, in layer order.
    pub fn output_nodes(&self) -> &[NodeId] {
        &self.output_nodes
    }

    fn ensure_built(&self) -> Result<()> {
        if self.built {
            Ok(())
        } else {
            Err(Error::graph(format!("{}: not built", self.name)))
        }
    }

    fn run_forward(&mut self, input: ArrayView1<f32>) -> Result<()> {
        self.ensure_built()?;
        if input.len() != self.n_inputs {
            return Err(Error::dimension(format!(
                "{}: forward input has {} values, expected {}",
                self.name,
                input.len(),
                self.n_inputs
            )));
        }
        for layer in 0..self.layers.len() {
            for i in 0..self.layers[layer].len() {
                let id = self.layers[layer][i];
                if self.nodes[id].producers.is_empty() {
                    self.inputs[id].assign(&input);
                } else {
                    let producers = self.nodes[id].producers.clone();
                    let mut offset = 0;
                    for p in producers {
                        let module = self.nodes[p].module.read();
                        let out = module.output();
                        self.inputs[id]
                            .slice_mut(ndarray::s![offset..offset + out.len()])
                            .assign(&out);
                        offset += out.len();
                    }
                }
                let node_input = self.inputs[id].view();
                self.nodes[id].module.write().forward(node_input)?;
            }
        }
        let mut offset = 0;
        for &id in &self.output_nodes {
            let module = self.nodes[id].module.read();
            let out = module.output();
            self.output
                .slice_mut(ndarray::s![offset..offset + out.len()])
                .assign(&out);
            offset += out.len();
        }
        Ok(())
    }

    fn run_backward(&mut self, output_grad: ArrayView1<f32>) -> Result<()> {
        self.ensure_built()?;
        if output_grad.len() != self.n_outputs {
            return Err(Error::dimension(format!(
                "{}: output gradient has {} values, expected {}",
                self.name,
                output_grad.len(),
                self.n_outputs
            )));
        }
        for g in self.grads.iter_mut() {
            g.fill(0.0);
        }
        self.input_grad.fill(0.0);

        // Seed the output layer: the incoming gradient splits across the
        // terminal nodes by output width.
        let mut offset = 0;
        for &id in &self.output_nodes {
            let width = self.nodes[id].n_outputs;
            self.grads[id].assign(&output_grad.slice(ndarray::s![offset..offset + width]));
            offset += width;
        }

        let mut reached: HashSet<NodeId> = self.output_nodes.iter().copied().collect();

        for layer in (0..self.layers.len()).rev() {
            for i in 0..self.layers[layer].len() {
                let id = self.layers[layer][i];
                if !reached.contains(&id) {
                    continue;
                }
                let node_input = self.inputs[id].clone();
                let grad = self.grads[id].clone();
                let detach = {
                    let mut module = self.nodes[id].module.write();
                    module.backward(node_input.view(), grad.view())?;
                    module.partial_backprop()
                };
                // A detached node still computes its own parameter and
                // input gradients; the graph just stops the flow here.
                if detach {
                    continue;
                }
                let input_grad = self.nodes[id].module.read().input_grad().to_owned();
                if self.nodes[id].producers.is_empty() {
                    self.input_grad += &input_grad;
                } else {
                    let producers = self.nodes[id].producers.clone();
                    let mut offset = 0;
                    for p in producers {
                        let width = self.nodes[p].n_outputs;
                        let slice = input_grad.slice(ndarray::s![offset..offset + width]);
                        self.grads[p] += &slice;
                        offset += width;
                        reached.insert(p);
                    }
                }
            }
        }
        Ok(())
    }
}

impl GradientModule for ComputationGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    fn forward(&mut self, input: ArrayView1<f32>) -> Result<()> {
        self.run_forward(input)
    }

    fn output(&self) -> ArrayView1<f32> {
        self.output.view()
    }

    fn backward(&mut self, _input: ArrayView1<f32>, output_grad: ArrayView1<f32>) -> Result<()> {
        self.run_backward(output_grad)
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
        let mut groups = Vec::new();
        for node in &self.nodes {
            groups.extend(node.module.read().param_groups());
        }
        unique_groups(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use parking_lot::RwLock;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    use crate::codec::Codec;
    use crate::module::{Identity, Nonlinearity};

    fn linear_codec(name: &str, n_in: usize, n_out: usize, seed: u64) -> Arc<RwLock<Codec>> {
        let mut rng = StdRng::seed_from_u64(seed);
        Arc::new(RwLock::new(Codec::new(
            name,
            n_in,
            n_out,
            Nonlinearity::Linear,
            false,
            &mut rng,
        )))
    }

    #[test]
    fn evaluating_an_unbuilt_graph_is_an_error() {
        let mut g = ComputationGraph::new("g");
        let a = g.add_module(linear_codec("a", 1, 1, 1));
        g.add_layer(&[a]).unwrap();

        assert!(matches!(
            g.forward(array![1.0].view()),
            Err(crate::error::Error::Graph(_))
        ));
        assert!(matches!(
            g.backward(array![1.0].view(), array![1.0].view()),
            Err(crate::error::Error::Graph(_))
        ));
    }

    #[test]
    fn build_twice_is_an_error() {
        let mut g = ComputationGraph::new("g");
        let a = g.add_module(linear_codec("a", 2, 2, 1));
        g.add_layer(&[a]).unwrap();
        g.build().unwrap();
        assert!(g.build().is_err());
    }

    #[test]
    fn width_mismatch_rejected_at_build() {
        let mut g = ComputationGraph::new("g");
        let a = g.add_module(linear_codec("a", 2, 3, 1));
        let b = g.add_module(linear_codec("b", 5, 2, 2));
        g.connect(a, b).unwrap();
        g.add_layer(&[a]).unwrap();
        g.add_layer(&[b]).unwrap();
        assert!(g.build().is_err());
    }

    #[test]
    fn forward_chains_layers_in_order() {
        let mut g = ComputationGraph::new("g");
        let a = linear_codec("a", 1, 1, 1);
        let b = linear_codec("b", 1, 1, 2);
        {
            let guard = a.read();
            guard.linear().weights().data_mut()[0] = 2.0;
            guard.linear().bias().data_mut()[0] = 0.0;
        }
        {
            let guard = b.read();
            guard.linear().weights().data_mut()[0] = 3.0;
            guard.linear().bias().data_mut()[0] = 1.0;
        }
        let na = g.add_module(a);
        let nb = g.add_module(b);
        g.connect(na, nb).unwrap();
        g.add_layer(&[na]).unwrap();
        g.add_layer(&[nb]).unwrap();
        g.build().unwrap();

        g.forward(array![4.0].view()).unwrap();
        // (4 * 2) * 3 + 1
        assert_relative_eq!(g.output()[0], 25.0);
    }

    #[test]
    fn output_gradient_splits_across_terminal_nodes() {
        // One identity fans out to two single-output linears in the
        // terminal layer.
        let mut g = ComputationGraph::new("g");
        let anchor = g.add_module(Arc::new(RwLock::new(Identity::new("in", 1))));
        let left = linear_codec("left", 1, 1, 3);
        let right = linear_codec("right", 1, 1, 4);
        {
            let guard = left.read();
            guard.linear().weights().data_mut()[0] = 2.0;
            guard.linear().bias().data_mut()[0] = 0.0;
        }
        {
            let guard = right.read();
            guard.linear().weights().data_mut()[0] = 5.0;
            guard.linear().bias().data_mut()[0] = 0.0;
        }
        let nl = g.add_module(left);
        let nr = g.add_module(right);
        g.connect(anchor, nl).unwrap();
        g.connect(anchor, nr).unwrap();
        g.add_layer(&[anchor]).unwrap();
        g.add_layer(&[nl, nr]).unwrap();
        g.build().unwrap();

        g.forward(array![1.0].view()).unwrap();
        assert_relative_eq!(g.output()[0], 2.0);
        assert_relative_eq!(g.output()[1], 5.0);

        g.backward(array![1.0].view(), array![1.0, 1.0].view()).unwrap();
        // Both branches flow back through the anchor: 2 + 5.
        assert_relative_eq!(g.input_grad()[0], 7.0);
    }

    #[test]
    fn detached_node_keeps_gradient_but_does_not_propagate() {
        let mut g = ComputationGraph::new("g");
        let a = linear_codec("a", 1, 1, 1);
        let b = linear_codec("b", 1, 1, 2);
        b.write().set_partial_backprop(true);
        let na = g.add_module(a.clone());
        let nb = g.add_module(b.clone());
        g.connect(na, nb).unwrap();
        g.add_layer(&[na]).unwrap();
        g.add_layer(&[nb]).unwrap();
        g.build().unwrap();

        g.forward(array![1.0].view()).unwrap();
        g.backward(array![1.0].view(), array![1.0].view()).unwrap();

        // Detached consumer accumulated its own parameter gradient.
        let b_guard = b.read();
        assert!(b_guard.linear().weights().grad()[0] != 0.0);
        drop(b_guard);
        // The producer upstream of the detachment saw no gradient.
        let a_guard = a.read();
        assert_eq!(a_guard.linear().weights().grad()[0], 0.0);
        assert_eq!(g.input_grad()[0], 0.0);
    }

    #[test]
    fn nested_graph_acts_as_a_module() {
        let mut inner = ComputationGraph::new("inner");
        let a = linear_codec("a", 1, 1, 7);
        {
            let guard = a.read();
            guard.linear().weights().data_mut()[0] = 4.0;
            guard.linear().bias().data_mut()[0] = 0.0;
        }
        let na = inner.add_module(a);
        inner.add_layer(&[na]).unwrap();
        inner.build().unwrap();

        let mut outer = ComputationGraph::new("outer");
        let nested = outer.add_module(Arc::new(RwLock::new(inner)));
        outer.add_layer(&[nested]).unwrap();
        outer.build().unwrap();

        outer.forward(array![2.0].view()).unwrap();
        assert_relative_eq!(outer.output()[0], 8.0);
        outer
            .backward(array![2.0].view(), array![1.0].view())
            .unwrap();
        assert_relative_eq!(outer.input_grad()[0], 4.0);
    }

    #[test]
    fn shared_parameters_deduplicated_in_param_groups() {
        let mut rng = StdRng::seed_from_u64(9);
        let enc = Codec::new("enc", 2, 2, Nonlinearity::Sigmoid, false, &mut rng);
        let twin = Codec::corrupted_twin("enc_noisy", &enc, Nonlinearity::Sigmoid, 1);

        let mut g = ComputationGraph::new("g");
        let ne = g.add_module(Arc::new(RwLock::new(enc)));
        let nt = g.add_module(Arc::new(RwLock::new(twin)));
        g.add_layer(&[ne, nt]).unwrap();
        g.build().unwrap();

        // Two codecs, one weight matrix and one bias between them.
        assert_eq!(g.param_groups().len(), 2);
    }
}
