//! Staged training controller.
//!
//! The trainer drives one phase at a time over a shared topology. Each
//! phase is a value object ([`PhaseSpec`]) naming the graph view, the loss
//! composition and the backward restrictions; the trainer assembles the
//! view, runs epochs to convergence or budget, and leaves every module
//! flag the way it found it. Nothing about the active graph or loss
//! survives between phases.

pub mod phase;
pub mod profile;
pub mod variance;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::criterion::{
    ClassNllCriterion, ConcatCriterion, Criterion, CrossEntropyCriterion, MseCriterion, Target,
};
use crate::data::Dataset;
use crate::error::{Error, Result};
use crate::module::{GradientModule, ModuleHandle, ParamGroup};
use crate::topology::{GraphView, StackedTopology};

pub use phase::{PhaseKind, PhaseReport, PhaseSpec};
pub use profile::GradientProfiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionLoss {
    Mse,
    CrossEntropy,
}

impl ReconstructionLoss {
    fn build(&self, width: usize) -> Box<dyn Criterion> {
        match self {
            ReconstructionLoss::Mse => Box::new(MseCriterion::new(width)),
            ReconstructionLoss::CrossEntropy => Box::new(CrossEntropyCriterion::new(width)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerOptions {
    pub reconstruction_loss: ReconstructionLoss,
    /// Sample count for gradient-variance estimation.
    pub variance_samples: usize,
    /// Keep per-layer gradient-angle statistics during joint phases.
    pub profile_gradients: bool,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            reconstruction_loss: ReconstructionLoss::Mse,
            variance_samples: 100,
            profile_gradients: false,
        }
    }
}

/// Supervised evaluation result.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub loss: f32,
    pub error_rate: f32,
}

pub struct StagedTrainer<'a> {
    topology: &'a StackedTopology,
    options: TrainerOptions,
    profiler: Option<GradientProfiler>,
}

impl<'a> StagedTrainer<'a> {
    pub fn new(topology: &'a StackedTopology, options: TrainerOptions) -> Result<Self> {
        if options.reconstruction_loss == ReconstructionLoss::CrossEntropy
            && !topology.options().reconstruction_activation.bounded_unit()
        {
            return Err(Error::config(
                "cross-entropy reconstruction requires a sigmoid reconstruction activation",
            ));
        }
        if options.profile_gradients && topology.options().noisy {
            return Err(Error::config(
                "gradient profiling is unavailable with noisy pretraining",
            ));
        }
        let profiler = options
            .profile_gradients
            .then(|| GradientProfiler::new(topology.n_hidden()));
        Ok(Self {
            topology,
            options,
            profiler,
        })
    }

    pub fn profiler(&self) -> Option<&GradientProfiler> {
        self.profiler.as_ref()
    }

    /// Run one phase. Layerwise phases yield one report per trained layer,
    /// every other phase a single report.
    pub fn run_phase(&mut self, phase: &PhaseSpec, dataset: &Dataset) -> Result<Vec<PhaseReport>> {
        if dataset.is_empty() {
            return Err(Error::data("empty dataset"));
        }
        if dataset.input_width() != self.topology.input_width() {
            return Err(Error::data(format!(
                "dataset width {} does not match topology input width {}",
                dataset.input_width(),
                self.topology.input_width()
            )));
        }
        info!(phase = phase.kind.name(), "phase start");
        match &phase.kind {
            PhaseKind::LayerwiseUnsupervised { cumulative, include } => {
                self.run_layerwise(phase, *cumulative, include.as_deref(), dataset)
            }
            PhaseKind::SelectiveSubset {
                include,
                propagate_down,
            } => self
                .run_selective(phase, include, *propagate_down, dataset)
                .map(|r| vec![r]),
            PhaseKind::Unsupervised { with_classifier } => self
                .run_unsupervised(phase, *with_classifier, dataset)
                .map(|r| vec![r]),
            PhaseKind::Joint {
                unsup_weight,
                detach_classifier,
                adaptive_weights,
            } => self
                .run_joint(phase, *unsup_weight, *detach_classifier, *adaptive_weights, dataset)
                .map(|r| vec![r]),
            PhaseKind::Supervised { layer_rates } => self
                .run_supervised(phase, layer_rates.as_deref(), dataset)
                .map(|r| vec![r]),
            PhaseKind::TopK { k } => self.run_topk(phase, *k, dataset).map(|r| vec![r]),
        }
    }

    /// Average supervised loss and classification error over `dataset`.
    pub fn evaluate(&self, dataset: &Dataset) -> Result<Evaluation> {
        let mut view = self.topology.supervised()?;
        let mut criterion = ClassNllCriterion::new(self.topology.output_width());
        let mut loss = 0.0;
        let mut errors = 0usize;
        for e in 0..dataset.len() {
            let input = dataset.input(e);
            let class = dataset.class(e)?;
            view.graph.forward(input)?;
            let out = view.graph.output();
            loss += criterion.forward(out, Target::Class(class))?;
            let predicted = out
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            if predicted != class {
                errors += 1;
            }
        }
        let n = dataset.len() as f32;
        Ok(Evaluation {
            loss: loss / n,
            error_rate: errors as f32 / n,
        })
    }

    fn recon_criterion(&self, width: usize) -> Box<dyn Criterion> {
        self.options.reconstruction_loss.build(width)
    }

    fn run_layerwise(
        &mut self,
        phase: &PhaseSpec,
        cumulative: bool,
        include: Option<&[bool]>,
        dataset: &Dataset,
    ) -> Result<Vec<PhaseReport>> {
        let n = self.topology.n_hidden();
        if let Some(inc) = include {
            if inc.len() != n {
                return Err(Error::config(format!(
                    "inclusion list covers {} layers, topology has {n}",
                    inc.len()
                )));
            }
        }
        let mut reports = Vec::new();
        for i in 0..n {
            if include.map(|inc| !inc[i]).unwrap_or(false) {
                continue;
            }
            let report = if cumulative {
                self.train_layer_cumulative(phase, i, dataset)?
            } else {
                self.train_layer_autoencoder(phase, i, dataset)?
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Train layer `i` on its own autoencoder, fed by representations
    /// precomputed through the frozen chain below it.
    fn train_layer_autoencoder(
        &mut self,
        phase: &PhaseSpec,
        i: usize,
        dataset: &Dataset,
    ) -> Result<PhaseReport> {
        let topo = self.topology;
        let reps: Vec<Array1<f32>> = (0..dataset.len())
            .map(|e| topo.encode_to(i, dataset.input(e)))
            .collect::<Result<_>>()?;
        let mut view = topo.autoencoder(i)?;
        let mut criterion = self.recon_criterion(topo.representation_width(i));
        let groups = view.graph.param_groups();
        run_epochs(&format!("layerwise-{i}"), phase, |_, rate| {
            criterion.reset();
            let mut total = 0.0;
            for rep in &reps {
                zero_grads(&groups);
                view.graph.forward(rep.view())?;
                let out = view.graph.output().to_owned();
                total += criterion.forward(out.view(), Target::Vector(rep.view()))?;
                criterion.backward(out.view(), Target::Vector(rep.view()))?;
                view.graph.backward(rep.view(), criterion.gradient())?;
                apply_update(&groups, rate);
            }
            Ok(total / reps.len() as f32)
        })
    }

    /// Train layer `i` on its cumulative graph; the chain below stays
    /// frozen through the partial-backprop boundary on the pretraining
    /// encoder.
    fn train_layer_cumulative(
        &mut self,
        phase: &PhaseSpec,
        i: usize,
        dataset: &Dataset,
    ) -> Result<PhaseReport> {
        let topo = self.topology;
        let boundary = topo.pretraining_encoder(i);
        boundary.write().set_partial_backprop(true);
        let result = (|| {
            let mut view = topo.cumulative(i)?;
            let mut criterion = self.recon_criterion(topo.representation_width(i));
            let groups = view.graph.param_groups();
            let chain_top = view.encoders.last().map(|&(_, node)| node);
            run_epochs(&format!("cumulative-{i}"), phase, |_, rate| {
                criterion.reset();
                let mut total = 0.0;
                for e in 0..dataset.len() {
                    let input = dataset.input(e);
                    zero_grads(&groups);
                    view.graph.forward(input)?;
                    let target = match chain_top {
                        Some(node) => view.graph.node_output(node)?,
                        None => input.to_owned(),
                    };
                    let out = view.graph.output().to_owned();
                    total += criterion.forward(out.view(), Target::Vector(target.view()))?;
                    criterion.backward(out.view(), Target::Vector(target.view()))?;
                    view.graph.backward(input, criterion.gradient())?;
                    apply_update(&groups, rate);
                }
                Ok(total / dataset.len() as f32)
            })
        })();
        boundary.write().set_partial_backprop(false);
        result
    }

    fn run_selective(
        &mut self,
        phase: &PhaseSpec,
        include: &[bool],
        propagate_down: bool,
        dataset: &Dataset,
    ) -> Result<PhaseReport> {
        let topo = self.topology;
        let mut view = topo.selective(include)?;

        // Gradient isolation: in noisy mode each branch is a nested
        // autoencoder whose input gradient can be withheld from the chain;
        // otherwise the cut sits on each chain encoder so a layer only
        // sees its own reconstruction gradient.
        let mut flagged: Vec<ModuleHandle> = Vec::new();
        if !propagate_down {
            let nodes: Vec<_> = if topo.options().noisy {
                view.reconstructions.iter().map(|&(_, n)| n).collect()
            } else {
                view.encoders.iter().map(|&(_, n)| n).collect()
            };
            for node in nodes {
                let module = view
                    .graph
                    .module(node)
                    .ok_or_else(|| Error::graph("selective view lost a node"))?;
                module.write().set_partial_backprop(true);
                flagged.push(module);
            }
        }

        let result = (|| {
            let mut concat = ConcatCriterion::new();
            for &(layer, _) in &view.reconstructions {
                concat.push(self.recon_criterion(topo.representation_width(layer)), 1.0);
            }
            let groups = view.graph.param_groups();
            run_epochs("selective-subset", phase, |_, rate| {
                concat.reset();
                let mut total = 0.0;
                for e in 0..dataset.len() {
                    let input = dataset.input(e);
                    zero_grads(&groups);
                    view.graph.forward(input)?;
                    let target_vecs = reconstruction_targets(&view, input)?;
                    let targets: Vec<Target> =
                        target_vecs.iter().map(|t| Target::Vector(t.view())).collect();
                    let out = view.graph.output().to_owned();
                    total += concat.forward(out.view(), &targets)?;
                    concat.backward(out.view(), &targets)?;
                    view.graph.backward(input, concat.gradient())?;
                    apply_update(&groups, rate);
                }
                Ok(total / dataset.len() as f32)
            })
        })();

        for module in flagged {
            module.write().set_partial_backprop(false);
        }
        result
    }

    fn run_unsupervised(
        &mut self,
        phase: &PhaseSpec,
        with_classifier: bool,
        dataset: &Dataset,
    ) -> Result<PhaseReport> {
        let topo = self.topology;
        let mut view = if with_classifier {
            if !dataset.is_labeled() {
                return Err(Error::data(
                    "unsupervised phase with classifier needs a labeled dataset",
                ));
            }
            topo.joint()?
        } else {
            topo.unsupervised()?
        };

        // The classifier trains on its own segment but stays detached from
        // the body during unsupervised pretraining.
        let classifier = topo.classifier();
        if with_classifier {
            classifier.write().set_partial_backprop(true);
        }

        let result = (|| {
            let mut concat = ConcatCriterion::new();
            if with_classifier {
                concat.push(Box::new(ClassNllCriterion::new(topo.output_width())), 1.0);
            }
            for &(layer, _) in &view.reconstructions {
                concat.push(self.recon_criterion(topo.representation_width(layer)), 1.0);
            }
            let groups = view.graph.param_groups();
            run_epochs("unsupervised", phase, |_, rate| {
                concat.reset();
                let mut total = 0.0;
                for e in 0..dataset.len() {
                    let input = dataset.input(e);
                    zero_grads(&groups);
                    view.graph.forward(input)?;
                    let target_vecs = reconstruction_targets(&view, input)?;
                    let mut targets: Vec<Target> = Vec::with_capacity(concat.len());
                    if with_classifier {
                        targets.push(Target::Class(dataset.class(e)?));
                    }
                    targets.extend(target_vecs.iter().map(|t| Target::Vector(t.view())));
                    let out = view.graph.output().to_owned();
                    total += concat.forward(out.view(), &targets)?;
                    concat.backward(out.view(), &targets)?;
                    view.graph.backward(input, concat.gradient())?;
                    apply_update(&groups, rate);
                }
                Ok(total / dataset.len() as f32)
            })
        })();

        if with_classifier {
            classifier.write().set_partial_backprop(false);
        }
        result
    }

    fn run_joint(
        &mut self,
        phase: &PhaseSpec,
        unsup_weight: f32,
        detach_classifier: bool,
        adaptive_weights: bool,
        dataset: &Dataset,
    ) -> Result<PhaseReport> {
        let topo = self.topology;
        if !dataset.is_labeled() {
            return Err(Error::data("joint phase needs a labeled dataset"));
        }
        let mut view = topo.joint()?;
        let classifier = topo.classifier();
        if detach_classifier {
            classifier.write().set_partial_backprop(true);
        }

        let variance_samples = self.options.variance_samples;
        let reconstruction_loss = self.options.reconstruction_loss;
        let profiler = self.profiler.as_mut();

        let result = (|| {
            let mut concat = ConcatCriterion::new();
            concat.push(Box::new(ClassNllCriterion::new(topo.output_width())), 1.0);
            for &(layer, _) in &view.reconstructions {
                concat.push(
                    reconstruction_loss.build(topo.representation_width(layer)),
                    unsup_weight,
                );
            }
            let groups = view.graph.param_groups();
            let mut profiler = profiler;
            run_epochs("joint", phase, |_, rate| {
                if adaptive_weights {
                    let weights =
                        eval_criterion_weights(&mut view, &mut concat, dataset, variance_samples)?;
                    for (idx, &w) in weights.iter().enumerate() {
                        concat.set_weight(idx, w);
                    }
                    debug!(?weights, "adaptive criterion weights");
                }
                concat.reset();
                let mut total = 0.0;
                for e in 0..dataset.len() {
                    let input = dataset.input(e);
                    let class = dataset.class(e)?;
                    zero_grads(&groups);
                    view.graph.forward(input)?;
                    let target_vecs = reconstruction_targets(&view, input)?;
                    let mut targets: Vec<Target> = vec![Target::Class(class)];
                    targets.extend(target_vecs.iter().map(|t| Target::Vector(t.view())));
                    let out = view.graph.output().to_owned();
                    total += concat.forward(out.view(), &targets)?;
                    concat.backward(out.view(), &targets)?;
                    view.graph.backward(input, concat.gradient())?;
                    if let Some(p) = profiler.as_deref_mut() {
                        profile_example(
                            topo, p, &mut view, &mut concat, &groups, input, &targets, out.view(),
                        )?;
                    }
                    apply_update(&groups, rate);
                }
                Ok(total / dataset.len() as f32)
            })
        })();

        if detach_classifier {
            classifier.write().set_partial_backprop(false);
        }
        if let Some(p) = self.profiler.as_ref() {
            p.log_summary();
        }
        result
    }

    fn run_supervised(
        &mut self,
        phase: &PhaseSpec,
        layer_rates: Option<&[f32]>,
        dataset: &Dataset,
    ) -> Result<PhaseReport> {
        let topo = self.topology;
        if !dataset.is_labeled() {
            return Err(Error::data("supervised phase needs a labeled dataset"));
        }
        let n = topo.n_hidden();
        if let Some(rates) = layer_rates {
            if rates.len() != n + 1 {
                return Err(Error::config(format!(
                    "{} per-layer rates for {n} encoders plus classifier",
                    rates.len()
                )));
            }
        }
        let mut view = topo.supervised()?;
        let mut criterion = ClassNllCriterion::new(topo.output_width());
        let groups = view.graph.param_groups();
        let layer_groups: Vec<Vec<ParamGroup>> = (0..n)
            .map(|i| topo.encoder(i).read().param_groups())
            .chain(std::iter::once(topo.classifier().read().param_groups()))
            .collect();

        run_epochs("supervised", phase, |_, rate| {
            criterion.reset();
            let mut total = 0.0;
            for e in 0..dataset.len() {
                let input = dataset.input(e);
                let target = Target::Class(dataset.class(e)?);
                zero_grads(&groups);
                view.graph.forward(input)?;
                let out = view.graph.output().to_owned();
                total += criterion.forward(out.view(), target)?;
                criterion.backward(out.view(), target)?;
                view.graph.backward(input, criterion.gradient())?;
                match layer_rates {
                    None => apply_update(&groups, rate),
                    Some(rates) => {
                        for (multiplier, layer) in rates.iter().zip(layer_groups.iter()) {
                            if *multiplier > 0.0 {
                                apply_update(layer, rate * multiplier);
                            }
                        }
                    }
                }
            }
            Ok(total / dataset.len() as f32)
        })
    }

    /// Supervised training where only the classifier and the top `k - 1`
    /// encoders receive gradient. Backward is an explicit chain of module
    /// calls threaded through stored intermediate gradients; the generic
    /// graph traversal would touch every module.
    fn run_topk(&mut self, phase: &PhaseSpec, k: usize, dataset: &Dataset) -> Result<PhaseReport> {
        let topo = self.topology;
        if !dataset.is_labeled() {
            return Err(Error::data("top-k phase needs a labeled dataset"));
        }
        let n = topo.n_hidden();
        if k == 0 || k > n + 1 {
            return Err(Error::config(format!(
                "top-k depth {k} outside 1..={}",
                n + 1
            )));
        }
        let mut view = topo.supervised()?;
        let mut criterion = ClassNllCriterion::new(topo.output_width());

        // Backward chain, loss first: classifier, then encoders n-1 down
        // to n-k+1. Paired with the hidden-layer index feeding each module
        // (n meaning the classifier input).
        let mut chain: Vec<(ModuleHandle, usize)> = Vec::with_capacity(k);
        let classifier: ModuleHandle = topo.classifier();
        chain.push((classifier, n));
        for j in ((n + 1 - k)..n).rev() {
            let encoder: ModuleHandle = topo.encoder(j);
            chain.push((encoder, j));
        }
        let groups: Vec<ParamGroup> = crate::module::unique_groups(
            chain
                .iter()
                .flat_map(|(m, _)| m.read().param_groups())
                .collect(),
        );

        run_epochs("top-k", phase, |_, rate| {
            criterion.reset();
            let mut total = 0.0;
            for e in 0..dataset.len() {
                let input = dataset.input(e);
                let target = Target::Class(dataset.class(e)?);
                zero_grads(&groups);
                view.graph.forward(input)?;
                let out = view.graph.output().to_owned();
                total += criterion.forward(out.view(), target)?;
                criterion.backward(out.view(), target)?;

                let mut grad = criterion.gradient().to_owned();
                for (module, feed_layer) in &chain {
                    let module_input = if *feed_layer == 0 {
                        input.to_owned()
                    } else {
                        let (_, node) = view.encoders[*feed_layer - 1];
                        view.graph.node_output(node)?
                    };
                    let mut m = module.write();
                    m.backward(module_input.view(), grad.view())?;
                    grad = m.input_grad().to_owned();
                }
                apply_update(&groups, rate);
            }
            Ok(total / dataset.len() as f32)
        })
    }
}

/// Reconstruction targets for a view's branches, ascending by layer. Call
/// after `forward`: branch `i` reconstructs the representation currently
/// feeding layer `i`.
fn reconstruction_targets(view: &GraphView, input: ArrayView1<f32>) -> Result<Vec<Array1<f32>>> {
    view.reconstructions
        .iter()
        .map(|&(layer, _)| {
            if layer == 0 {
                Ok(input.to_owned())
            } else {
                let node = view
                    .encoders
                    .iter()
                    .find(|&&(j, _)| j == layer - 1)
                    .map(|&(_, n)| n)
                    .ok_or_else(|| {
                        Error::graph(format!("no encoder below reconstruction branch {layer}"))
                    })?;
                view.graph.node_output(node)
            }
        })
        .collect()
}

fn zero_grads(groups: &[ParamGroup]) {
    for g in groups {
        g.zero_grad();
    }
}

fn apply_update(groups: &[ParamGroup], rate: f32) {
    for g in groups {
        g.apply_step(rate);
    }
}

fn flatten_grads(groups: &[ParamGroup]) -> Vec<f32> {
    let mut flat = Vec::new();
    for g in groups {
        flat.extend_from_slice(&g.grad());
    }
    flat
}

/// Epoch loop with per-epoch rate decay and relative-improvement stopping.
fn run_epochs<F>(name: &str, phase: &PhaseSpec, mut epoch_fn: F) -> Result<PhaseReport>
where
    F: FnMut(usize, f32) -> Result<f32>,
{
    let mut previous: Option<f32> = None;
    let mut last = f32::INFINITY;
    let mut converged = false;
    let mut epochs = 0;
    for e in 0..phase.max_epochs {
        let rate = phase.rate_at(e);
        let loss = epoch_fn(e, rate)?;
        epochs = e + 1;
        last = loss;
        debug!(phase = name, epoch = e, loss, rate, "epoch");
        if let Some(p) = previous {
            if p.is_finite() && (p - loss) / p.abs().max(f32::EPSILON) < phase.end_accuracy {
                converged = true;
                break;
            }
        }
        previous = Some(loss);
    }
    info!(phase = name, epochs, loss = last, converged, "phase done");
    Ok(PhaseReport {
        phase: name.to_string(),
        epochs,
        final_loss: last,
        converged,
    })
}

/// Gradient-variance estimate per criterion over the first
/// `variance_samples` examples; returns the derived loss weights with the
/// supervised weight pinned at 1.0. Assumes part 0 of `concat` is the
/// supervised criterion, as assembled by the joint phase.
fn eval_criterion_weights(
    view: &mut GraphView,
    concat: &mut ConcatCriterion,
    dataset: &Dataset,
    variance_samples: usize,
) -> Result<Vec<f32>> {
    let samples = variance_samples.min(dataset.len());
    if samples < 2 {
        return Ok(vec![1.0; concat.len()]);
    }
    let groups = view.graph.param_groups();
    let dim: usize = groups.iter().map(|g| g.len()).sum();
    let mut variances = Vec::with_capacity(concat.len());
    for part in 0..concat.len() {
        let mut moments = variance::RunningMoments::new(dim);
        for s in 0..samples {
            let input = dataset.input(s);
            zero_grads(&groups);
            view.graph.forward(input)?;
            let out = view.graph.output().to_owned();
            if part == 0 {
                concat.backward_part(part, out.view(), Target::Class(dataset.class(s)?))?;
            } else {
                let targets = reconstruction_targets(view, input)?;
                let target = &targets[part - 1];
                concat.backward_part(part, out.view(), Target::Vector(target.view()))?;
            }
            view.graph.backward(input, concat.gradient())?;
            let flat = flatten_grads(&groups);
            variance::warn_on_large_gradients(if part == 0 { "supervised" } else { "reconstruction" }, &flat);
            moments.update(&flat);
        }
        variances.push(moments.max_variance().1);
    }
    Ok(variance::variance_weights(&variances))
}

/// One example's worth of profiling during a joint phase: per hidden
/// layer, snapshot the layer gradient under the joint loss, the supervised
/// loss alone and the layer's own reconstruction loss alone, then fold the
/// pairwise angles into the running statistics. Re-runs the joint backward
/// afterwards so the caller's update sees the joint gradient.
#[allow(clippy::too_many_arguments)]
fn profile_example(
    topology: &StackedTopology,
    profiler: &mut GradientProfiler,
    view: &mut GraphView,
    concat: &mut ConcatCriterion,
    groups: &[ParamGroup],
    input: ArrayView1<f32>,
    targets: &[Target],
    output: ArrayView1<f32>,
) -> Result<()> {
    let n = topology.n_hidden();
    let joint: Vec<Vec<f32>> = (0..n).map(|i| layer_gradient(topology, i)).collect();

    zero_grads(groups);
    concat.backward_part(0, output, targets[0])?;
    view.graph.backward(input, concat.gradient())?;
    let supervised: Vec<Vec<f32>> = (0..n).map(|i| layer_gradient(topology, i)).collect();

    for (pos, &(layer, _)) in view.reconstructions.iter().enumerate() {
        zero_grads(groups);
        concat.backward_part(1 + pos, output, targets[1 + pos])?;
        view.graph.backward(input, concat.gradient())?;
        let local = layer_gradient(topology, layer);
        profiler.record(layer, &joint[layer], &supervised[layer], &local);
    }

    zero_grads(groups);
    concat.backward(output, targets)?;
    view.graph.backward(input, concat.gradient())?;
    Ok(())
}

/// Encoder `i`'s weight and bias gradients, flattened.
fn layer_gradient(topology: &StackedTopology, i: usize) -> Vec<f32> {
    let codec = topology.encoder(i);
    let guard = codec.read();
    let linear = guard.linear();
    let mut flat = linear.weights().grad().to_vec();
    flat.extend_from_slice(&linear.bias().grad());
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyOptions;
    use ndarray::array;

    fn small_dataset() -> Dataset {
        Dataset::labeled(
            array![[1.0, 0.0, 1.0, 0.0], [0.0, 1.0, 0.0, 1.0]],
            vec![0, 1],
        )
        .unwrap()
    }

    fn snapshot(groups: &[ParamGroup]) -> Vec<Vec<f32>> {
        groups.iter().map(|g| g.data().to_vec()).collect()
    }

    fn one_epoch(kind: PhaseKind) -> PhaseSpec {
        PhaseSpec::new(kind, 1).with_learning_rate(0.1)
    }

    #[test]
    fn layerwise_touches_only_the_trained_layer() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = Dataset::unlabeled(array![[1.0, 0.0, 1.0, 0.0]]);

        let classifier_before = snapshot(&topo.classifier().read().param_groups());
        let encoder_before = snapshot(&topo.encoder(0).read().param_groups());
        let decoder_before = snapshot(&topo.decoder(0).read().param_groups());

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::LayerwiseUnsupervised {
            cumulative: false,
            include: None,
        });
        trainer.run_phase(&phase, &dataset).unwrap();

        // Classifier parameters are bit-identical to initialization.
        assert_eq!(
            classifier_before,
            snapshot(&topo.classifier().read().param_groups())
        );
        assert_ne!(
            encoder_before,
            snapshot(&topo.encoder(0).read().param_groups())
        );
        assert_ne!(
            decoder_before,
            snapshot(&topo.decoder(0).read().param_groups())
        );
    }

    #[test]
    fn cumulative_freezes_layers_below_the_boundary() {
        let topo = StackedTopology::new(vec![4, 3, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = Dataset::unlabeled(array![[1.0, 0.0, 1.0, 0.0]]);

        let lower_before = snapshot(&topo.encoder(0).read().param_groups());
        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::LayerwiseUnsupervised {
            cumulative: true,
            include: Some(vec![false, true]),
        });
        trainer.run_phase(&phase, &dataset).unwrap();

        // Layer 0 fed the graph but sat below the gradient boundary.
        assert_eq!(lower_before, snapshot(&topo.encoder(0).read().param_groups()));
        let boundary_flag = topo.pretraining_encoder(1).read().partial_backprop();
        assert!(!boundary_flag, "boundary flag must be restored");
    }

    #[test]
    fn noisy_unsupervised_phase_completes_with_full_corruption() {
        let mut opts = TopologyOptions::default();
        opts.noisy = true;
        opts.corruption_probability = 1.0;
        let topo = StackedTopology::new(vec![4, 3, 2], opts).unwrap();
        let dataset = Dataset::unlabeled(array![[1.0, 0.0, 1.0, 0.0]]);

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::Unsupervised {
            with_classifier: false,
        });
        let reports = trainer.run_phase(&phase, &dataset).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].final_loss.is_finite());
    }

    #[test]
    fn selective_subset_leaves_excluded_layers_untouched() {
        let topo = StackedTopology::new(vec![5, 4, 3, 2, 2], TopologyOptions::default()).unwrap();
        let dataset = Dataset::unlabeled(array![[1.0, 0.0, 1.0, 0.0, 1.0]]);

        let excluded_before = snapshot(&topo.encoder(2).read().param_groups());
        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::SelectiveSubset {
            include: vec![true, true, false],
            propagate_down: false,
        });
        trainer.run_phase(&phase, &dataset).unwrap();

        assert_eq!(excluded_before, snapshot(&topo.encoder(2).read().param_groups()));
        // Isolation flags restored.
        assert!(!topo.encoder(0).read().partial_backprop());
        assert!(!topo.encoder(1).read().partial_backprop());
    }

    #[test]
    fn unsupervised_with_classifier_keeps_the_body_free_of_supervised_gradient() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = small_dataset();

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::Unsupervised {
            with_classifier: true,
        });
        let classifier_before = snapshot(&topo.classifier().read().param_groups());
        trainer.run_phase(&phase, &dataset).unwrap();

        // The classifier did train on its own segment.
        assert_ne!(
            classifier_before,
            snapshot(&topo.classifier().read().param_groups())
        );
        assert!(!topo.classifier().read().partial_backprop());
    }

    #[test]
    fn supervised_layer_rates_freeze_zero_rated_layers() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = small_dataset();

        let encoder_before = snapshot(&topo.encoder(0).read().param_groups());
        let classifier_before = snapshot(&topo.classifier().read().param_groups());

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::Supervised {
            layer_rates: Some(vec![0.0, 1.0]),
        });
        trainer.run_phase(&phase, &dataset).unwrap();

        assert_eq!(encoder_before, snapshot(&topo.encoder(0).read().param_groups()));
        assert_ne!(
            classifier_before,
            snapshot(&topo.classifier().read().param_groups())
        );
    }

    #[test]
    fn supervised_rejects_wrong_rate_count() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::Supervised {
            layer_rates: Some(vec![1.0, 1.0, 1.0, 1.0]),
        });
        assert!(trainer.run_phase(&phase, &small_dataset()).is_err());
    }

    #[test]
    fn top_one_trains_only_the_classifier() {
        let topo = StackedTopology::new(vec![4, 3, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = small_dataset();

        let enc0_before = snapshot(&topo.encoder(0).read().param_groups());
        let enc1_before = snapshot(&topo.encoder(1).read().param_groups());
        let classifier_before = snapshot(&topo.classifier().read().param_groups());

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::TopK { k: 1 });
        trainer.run_phase(&phase, &dataset).unwrap();

        assert_eq!(enc0_before, snapshot(&topo.encoder(0).read().param_groups()));
        assert_eq!(enc1_before, snapshot(&topo.encoder(1).read().param_groups()));
        assert_ne!(
            classifier_before,
            snapshot(&topo.classifier().read().param_groups())
        );
    }

    #[test]
    fn top_two_reaches_the_highest_encoder_only() {
        let topo = StackedTopology::new(vec![4, 3, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = small_dataset();

        let enc0_before = snapshot(&topo.encoder(0).read().param_groups());
        let enc1_before = snapshot(&topo.encoder(1).read().param_groups());

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::TopK { k: 2 });
        trainer.run_phase(&phase, &dataset).unwrap();

        assert_eq!(enc0_before, snapshot(&topo.encoder(0).read().param_groups()));
        assert_ne!(enc1_before, snapshot(&topo.encoder(1).read().param_groups()));
    }

    #[test]
    fn top_k_depth_validated() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::TopK { k: 3 });
        assert!(trainer.run_phase(&phase, &small_dataset()).is_err());
    }

    #[test]
    fn joint_phase_trains_everything() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = small_dataset();

        let enc_before = snapshot(&topo.encoder(0).read().param_groups());
        let cls_before = snapshot(&topo.classifier().read().param_groups());

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::Joint {
            unsup_weight: 0.5,
            detach_classifier: false,
            adaptive_weights: false,
        });
        trainer.run_phase(&phase, &dataset).unwrap();

        assert_ne!(enc_before, snapshot(&topo.encoder(0).read().param_groups()));
        assert_ne!(cls_before, snapshot(&topo.classifier().read().param_groups()));
    }

    #[test]
    fn adaptive_weights_pin_the_supervised_term() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = Dataset::labeled(
            array![
                [1.0, 0.0, 1.0, 0.0],
                [0.0, 1.0, 0.0, 1.0],
                [1.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 1.0]
            ],
            vec![0, 1, 0, 1],
        )
        .unwrap();

        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let phase = one_epoch(PhaseKind::Joint {
            unsup_weight: 1.0,
            detach_classifier: false,
            adaptive_weights: true,
        });
        let reports = trainer.run_phase(&phase, &dataset).unwrap();
        assert!(reports[0].final_loss.is_finite());
    }

    #[test]
    fn profiling_rejected_in_noisy_mode() {
        let mut topo_opts = TopologyOptions::default();
        topo_opts.noisy = true;
        let topo = StackedTopology::new(vec![4, 3, 2], topo_opts).unwrap();
        let mut opts = TrainerOptions::default();
        opts.profile_gradients = true;
        assert!(StagedTrainer::new(&topo, opts).is_err());
    }

    #[test]
    fn profiler_collects_angles_during_joint_training() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let mut opts = TrainerOptions::default();
        opts.profile_gradients = true;
        let mut trainer = StagedTrainer::new(&topo, opts).unwrap();
        let phase = one_epoch(PhaseKind::Joint {
            unsup_weight: 1.0,
            detach_classifier: false,
            adaptive_weights: false,
        });
        trainer.run_phase(&phase, &small_dataset()).unwrap();
        let profiler = trainer.profiler().unwrap();
        assert!(profiler.layer(0).joint_vs_supervised.count() > 0);
    }

    #[test]
    fn convergence_stops_early() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let dataset = small_dataset();
        let mut trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let mut phase = PhaseSpec::new(PhaseKind::Supervised { layer_rates: None }, 500)
            .with_learning_rate(0.0);
        phase.end_accuracy = 1e-6;
        // Zero learning rate: the loss cannot improve, so the phase ends
        // after the second epoch.
        let reports = trainer.run_phase(&phase, &dataset).unwrap();
        assert!(reports[0].converged);
        assert_eq!(reports[0].epochs, 2);
    }

    #[test]
    fn evaluate_reports_loss_and_errors() {
        let topo = StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap();
        let trainer = StagedTrainer::new(&topo, TrainerOptions::default()).unwrap();
        let eval = trainer.evaluate(&small_dataset()).unwrap();
        assert!(eval.loss.is_finite());
        assert!((0.0..=1.0).contains(&eval.error_rate));
    }

    #[test]
    fn cross_entropy_requires_bounded_reconstruction() {
        let mut topo_opts = TopologyOptions::default();
        topo_opts.reconstruction_activation = crate::module::Nonlinearity::Linear;
        let topo = StackedTopology::new(vec![4, 3, 2], topo_opts).unwrap();
        let mut opts = TrainerOptions::default();
        opts.reconstruction_loss = ReconstructionLoss::CrossEntropy;
        assert!(StagedTrainer::new(&topo, opts).is_err());
    }
}
