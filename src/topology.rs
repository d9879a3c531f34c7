//! Stacked encoder/decoder topology and its derived graph views.
//!
//! The topology owns every codec once: N encoders, N decoders, the noisy
//! encoder twins when noise is enabled, and the classifier head. Graph
//! views are assembled on demand from shared handles, so every view aliases
//! the same parameter storage. Builders cover the per-layer autoencoder,
//! the cumulative per-layer graph, the supervised chain, the unsupervised
//! reconstruction graph, the joint graph and caller-selected subsets.

use std::sync::Arc;

use ndarray::{Array1, ArrayView1};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::graph::{ComputationGraph, NodeId};
use crate::module::{unique_groups, GradientModule, Identity, ModuleHandle, Nonlinearity, ParamGroup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyOptions {
    /// Decoders view their encoder's weights transposed instead of owning
    /// an independent matrix.
    pub tied: bool,
    /// Tied decoders additionally learn an additive adjustment on the
    /// shared weights.
    pub reparametrize_tied: bool,
    /// Pretraining corrupts encoder inputs through noisy encoder twins.
    pub noisy: bool,
    /// Penalize weight differences across adjacent inputs of the first
    /// encoder.
    pub first_layer_smoothed: bool,
    pub hidden_activation: Nonlinearity,
    pub reconstruction_activation: Nonlinearity,
    pub corruption_probability: f32,
    pub corruption_value: f32,
    pub weight_l1_decay: f32,
    pub weight_l2_decay: f32,
    pub bias_decay: f32,
    pub smoothing_l1_decay: f32,
    pub smoothing_l2_decay: f32,
    pub seed: u64,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            tied: false,
            reparametrize_tied: false,
            noisy: false,
            first_layer_smoothed: false,
            hidden_activation: Nonlinearity::Sigmoid,
            reconstruction_activation: Nonlinearity::Sigmoid,
            corruption_probability: 0.25,
            corruption_value: 0.0,
            weight_l1_decay: 0.0,
            weight_l2_decay: 0.0,
            bias_decay: 0.0,
            smoothing_l1_decay: 0.0,
            smoothing_l2_decay: 0.0,
            seed: 42,
        }
    }
}

/// A built graph view plus the node handles a trainer needs to drive it.
pub struct GraphView {
    pub graph: ComputationGraph,
    /// Plain encoder chain nodes present in this view, as (layer, node).
    pub encoders: Vec<(usize, NodeId)>,
    /// Reconstruction branch per included hidden layer, ascending, in the
    /// order their outputs are concatenated.
    pub reconstructions: Vec<(usize, NodeId)>,
    pub classifier: Option<NodeId>,
    pub anchor: Option<NodeId>,
}

pub struct StackedTopology {
    /// Input width, N hidden widths, output width.
    widths: Vec<usize>,
    options: TopologyOptions,
    encoders: Vec<Arc<RwLock<Codec>>>,
    /// Corrupted twins of the encoders; empty unless noisy.
    noisy_encoders: Vec<Arc<RwLock<Codec>>>,
    decoders: Vec<Arc<RwLock<Codec>>>,
    classifier: Arc<RwLock<Codec>>,
}

fn as_module(codec: &Arc<RwLock<Codec>>) -> ModuleHandle {
    codec.clone()
}

impl StackedTopology {
    pub fn new(widths: Vec<usize>, options: TopologyOptions) -> Result<Self> {
        if widths.len() < 3 {
            return Err(Error::config(format!(
                "topology needs input, at least one hidden and output width, got {widths:?}"
            )));
        }
        if widths.iter().any(|&w| w == 0) {
            return Err(Error::config("topology widths must be nonzero"));
        }
        if options.reparametrize_tied && !options.tied {
            return Err(Error::config(
                "reparametrized tying requires tied weights",
            ));
        }
        if options.noisy
            && !(0.0..=1.0).contains(&options.corruption_probability)
        {
            return Err(Error::config(format!(
                "corruption probability {} outside [0, 1]",
                options.corruption_probability
            )));
        }

        let n = widths.len() - 2;
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut encoders = Vec::with_capacity(n);
        let mut noisy_encoders = Vec::new();
        let mut decoders = Vec::with_capacity(n);

        for i in 0..n {
            let mut encoder = Codec::new(
                format!("encoder-{i}"),
                widths[i],
                widths[i + 1],
                options.hidden_activation,
                options.first_layer_smoothed && i == 0,
                &mut rng,
            );
            if options.weight_l1_decay > 0.0 || options.weight_l2_decay > 0.0 {
                encoder
                    .linear_mut()
                    .set_weight_decay(options.weight_l1_decay, options.weight_l2_decay);
            }
            if options.bias_decay > 0.0 {
                encoder.linear_mut().set_bias_decay(options.bias_decay);
            }
            if encoder.is_smoothed() {
                encoder
                    .linear_mut()
                    .set_smoothing_decay(options.smoothing_l1_decay, options.smoothing_l2_decay);
            }

            let mut decoder = if options.tied {
                Codec::tied(
                    format!("decoder-{i}"),
                    &encoder,
                    options.reconstruction_activation,
                    options.reparametrize_tied,
                    &mut rng,
                )
            } else {
                Codec::new(
                    format!("decoder-{i}"),
                    widths[i + 1],
                    widths[i],
                    options.reconstruction_activation,
                    false,
                    &mut rng,
                )
            };
            if !options.tied
                && (options.weight_l1_decay > 0.0 || options.weight_l2_decay > 0.0)
            {
                decoder
                    .linear_mut()
                    .set_weight_decay(options.weight_l1_decay, options.weight_l2_decay);
            }

            if options.noisy {
                let mut twin = Codec::corrupted_twin(
                    format!("encoder-{i}-noisy"),
                    &encoder,
                    options.hidden_activation,
                    options.seed.wrapping_add(1 + i as u64),
                );
                twin.set_corruption_options(
                    options.corruption_probability,
                    options.corruption_value,
                );
                noisy_encoders.push(Arc::new(RwLock::new(twin)));
            }

            encoders.push(Arc::new(RwLock::new(encoder)));
            decoders.push(Arc::new(RwLock::new(decoder)));
        }

        let mut classifier = Codec::new(
            "classifier",
            widths[n],
            widths[n + 1],
            Nonlinearity::LogSoftmax,
            false,
            &mut rng,
        );
        if options.weight_l1_decay > 0.0 || options.weight_l2_decay > 0.0 {
            classifier
                .linear_mut()
                .set_weight_decay(options.weight_l1_decay, options.weight_l2_decay);
        }

        Ok(Self {
            widths,
            options,
            encoders,
            noisy_encoders,
            decoders,
            classifier: Arc::new(RwLock::new(classifier)),
        })
    }

    pub fn n_hidden(&self) -> usize {
        self.widths.len() - 2
    }

    pub fn input_width(&self) -> usize {
        self.widths[0]
    }

    pub fn output_width(&self) -> usize {
        self.widths[self.widths.len() - 1]
    }

    /// Width of the representation entering hidden layer `i`.
    pub fn representation_width(&self, i: usize) -> usize {
        self.widths[i]
    }

    pub fn options(&self) -> &TopologyOptions {
        &self.options
    }

    pub fn encoder(&self, i: usize) -> Arc<RwLock<Codec>> {
        self.encoders[i].clone()
    }

    pub fn decoder(&self, i: usize) -> Arc<RwLock<Codec>> {
        self.decoders[i].clone()
    }

    pub fn classifier(&self) -> Arc<RwLock<Codec>> {
        self.classifier.clone()
    }

    /// The encoder used by pretraining branches: the corrupted twin when
    /// noise is enabled, the plain encoder otherwise.
    pub fn pretraining_encoder(&self, i: usize) -> Arc<RwLock<Codec>> {
        if self.options.noisy {
            self.noisy_encoders[i].clone()
        } else {
            self.encoders[i].clone()
        }
    }

    /// Every parameter group in the topology, deduplicated by storage
    /// identity and in a stable order.
    pub fn param_groups(&self) -> Vec<ParamGroup> {
        let mut groups = Vec::new();
        for (i, enc) in self.encoders.iter().enumerate() {
            groups.extend(enc.read().param_groups());
            groups.extend(self.decoders[i].read().param_groups());
        }
        for twin in &self.noisy_encoders {
            groups.extend(twin.read().param_groups());
        }
        groups.extend(self.classifier.read().param_groups());
        unique_groups(groups)
    }

    /// Run the plain encoder chain up to (not including) `layer`, returning
    /// the representation that feeds hidden layer `layer`.
    pub fn encode_to(&self, layer: usize, input: ArrayView1<f32>) -> Result<Array1<f32>> {
        let mut current = input.to_owned();
        for encoder in self.encoders.iter().take(layer) {
            let mut enc = encoder.write();
            enc.forward(current.view())?;
            current = enc.output().to_owned();
        }
        Ok(current)
    }

    /// Per-layer autoencoder: pretraining encoder feeding its decoder. The
    /// graph input is the uncorrupted representation at `i`; in noisy mode
    /// the corruption happens inside the encoder twin.
    pub fn autoencoder(&self, i: usize) -> Result<GraphView> {
        self.check_layer(i)?;
        let mut graph = ComputationGraph::new(format!("autoencoder-{i}"));
        let enc = graph.add_module(as_module(&self.pretraining_encoder(i)));
        let dec = graph.add_module(as_module(&self.decoders[i]));
        graph.connect(enc, dec)?;
        graph.add_layer(&[enc])?;
        graph.add_layer(&[dec])?;
        graph.build()?;
        Ok(GraphView {
            graph,
            encoders: Vec::new(),
            reconstructions: vec![(i, dec)],
            classifier: None,
            anchor: None,
        })
    }

    /// Cumulative per-layer graph: the plain chain below `i` feeding layer
    /// `i`'s autoencoder, so reconstruction at `i` is measured on the
    /// representations the lower layers actually produce.
    pub fn cumulative(&self, i: usize) -> Result<GraphView> {
        self.check_layer(i)?;
        let mut graph = ComputationGraph::new(format!("cumulative-{i}"));
        let mut encoders = Vec::new();
        let mut previous: Option<NodeId> = None;
        for j in 0..i {
            let node = graph.add_module(as_module(&self.encoders[j]));
            if let Some(p) = previous {
                graph.connect(p, node)?;
            }
            graph.add_layer(&[node])?;
            encoders.push((j, node));
            previous = Some(node);
        }
        let enc = graph.add_module(as_module(&self.pretraining_encoder(i)));
        if let Some(p) = previous {
            graph.connect(p, enc)?;
        }
        let dec = graph.add_module(as_module(&self.decoders[i]));
        graph.connect(enc, dec)?;
        graph.add_layer(&[enc])?;
        graph.add_layer(&[dec])?;
        graph.build()?;
        Ok(GraphView {
            graph,
            encoders,
            reconstructions: vec![(i, dec)],
            classifier: None,
            anchor: None,
        })
    }

    /// End-to-end supervised chain: plain encoders into the classifier.
    pub fn supervised(&self) -> Result<GraphView> {
        let mut graph = ComputationGraph::new("supervised");
        let mut encoders = Vec::new();
        let mut previous: Option<NodeId> = None;
        for (j, encoder) in self.encoders.iter().enumerate() {
            let node = graph.add_module(as_module(encoder));
            if let Some(p) = previous {
                graph.connect(p, node)?;
            }
            graph.add_layer(&[node])?;
            encoders.push((j, node));
            previous = Some(node);
        }
        let classifier = graph.add_module(as_module(&self.classifier));
        if let Some(p) = previous {
            graph.connect(p, classifier)?;
        }
        graph.add_layer(&[classifier])?;
        graph.build()?;
        Ok(GraphView {
            graph,
            encoders,
            reconstructions: Vec::new(),
            classifier: Some(classifier),
            anchor: None,
        })
    }

    /// Unsupervised graph: every layer's reconstruction branch, no
    /// classifier. In noisy mode the branches are whole autoencoder
    /// modules hanging off the representation below them, and the final
    /// plain encoder is left out of the chain entirely since nothing would
    /// consume its output.
    pub fn unsupervised(&self) -> Result<GraphView> {
        let include = vec![true; self.n_hidden()];
        self.build_reconstruction_graph("unsupervised", &include, false)
    }

    /// Joint graph: the supervised chain plus every reconstruction branch
    /// attached to the same encoder outputs. The classifier output comes
    /// first in the concatenation.
    pub fn joint(&self) -> Result<GraphView> {
        let include = vec![true; self.n_hidden()];
        self.build_reconstruction_graph("joint", &include, true)
    }

    /// Selective subset: reconstruction branches only for the included
    /// layers, encoders built only up to the highest included layer.
    pub fn selective(&self, include: &[bool]) -> Result<GraphView> {
        if include.len() != self.n_hidden() {
            return Err(Error::config(format!(
                "inclusion list covers {} layers, topology has {}",
                include.len(),
                self.n_hidden()
            )));
        }
        if !include.iter().any(|&b| b) {
            return Err(Error::config("inclusion list selects no layer"));
        }
        self.build_reconstruction_graph("selective", include, false)
    }

    /// Shared assembly for the unsupervised, joint and selective views.
    ///
    /// The plain chain runs up to the last encoder whose output something
    /// consumes: the layer below the topmost branch in noisy mode (each
    /// branch reads the representation underneath it), the topmost branch
    /// layer otherwise, and the full stack whenever the classifier is in.
    fn build_reconstruction_graph(
        &self,
        name: &str,
        include: &[bool],
        with_classifier: bool,
    ) -> Result<GraphView> {
        let n = self.n_hidden();
        let topmost = include
            .iter()
            .rposition(|&b| b)
            .ok_or_else(|| Error::config("inclusion list selects no layer"))?;

        let chain_len = if with_classifier {
            n
        } else if self.options.noisy {
            topmost
        } else {
            topmost + 1
        };

        let mut graph = ComputationGraph::new(name);
        let noisy_layer0_branch = self.options.noisy && include[0];
        let anchor = noisy_layer0_branch.then(|| {
            graph.add_module(Arc::new(RwLock::new(Identity::new(
                "input-anchor",
                self.input_width(),
            ))))
        });

        let mut encoders = Vec::new();
        let mut chain_nodes: Vec<NodeId> = Vec::new();
        for j in 0..chain_len {
            let node = graph.add_module(as_module(&self.encoders[j]));
            if let Some(&p) = chain_nodes.last() {
                graph.connect(p, node)?;
            }
            if j == 0 {
                match anchor {
                    Some(a) => graph.add_layer(&[a, node])?,
                    None => graph.add_layer(&[node])?,
                }
            } else {
                graph.add_layer(&[node])?;
            }
            encoders.push((j, node));
            chain_nodes.push(node);
        }
        if chain_len == 0 {
            if let Some(a) = anchor {
                graph.add_layer(&[a])?;
            }
        }

        let mut terminal = Vec::new();
        let mut reconstructions = Vec::new();
        let classifier = if with_classifier {
            let node = graph.add_module(as_module(&self.classifier));
            if let Some(&p) = chain_nodes.last() {
                graph.connect(p, node)?;
            }
            terminal.push(node);
            Some(node)
        } else {
            None
        };

        for (i, &included) in include.iter().enumerate() {
            if !included {
                continue;
            }
            let branch = if self.options.noisy {
                // Whole per-layer autoencoder as one nested module, fed by
                // the representation below layer i.
                let view = self.autoencoder(i)?;
                let node = graph.add_module(Arc::new(RwLock::new(view.graph)));
                let producer = if i == 0 {
                    anchor.ok_or_else(|| {
                        Error::graph("noisy layer-0 branch has no input anchor")
                    })?
                } else {
                    chain_nodes[i - 1]
                };
                graph.connect(producer, node)?;
                node
            } else {
                let node = graph.add_module(as_module(&self.decoders[i]));
                graph.connect(chain_nodes[i], node)?;
                node
            };
            terminal.push(branch);
            reconstructions.push((i, branch));
        }

        graph.add_layer(&terminal)?;
        graph.build()?;
        Ok(GraphView {
            graph,
            encoders,
            reconstructions,
            classifier,
            anchor,
        })
    }

    fn check_layer(&self, i: usize) -> Result<()> {
        if i < self.n_hidden() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "hidden layer {i} out of range, topology has {}",
                self.n_hidden()
            )))
        }
    }
}
