//! saestack - staged training of stacked autoencoders
//!
//! This crate builds layered encoder/decoder networks and trains them
//! through a configurable sequence of pretraining and fine-tuning phases.
//! The heart of it is a composable computation graph over shared modules:
//! the same encoders participate in per-layer autoencoder graphs, a
//! supervised chain, an unsupervised reconstruction graph and joint views,
//! all aliasing one set of parameters.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod criterion;
pub mod data;
pub mod error;
pub mod graph;
pub mod module;
pub mod pca;
pub mod topology;
pub mod trainer;

// Re-exports
pub use checkpoint::CheckpointManager;
pub use codec::Codec;
pub use config::Config;
pub use criterion::{ConcatCriterion, Criterion, Target};
pub use data::Dataset;
pub use error::{Error, Result};
pub use graph::ComputationGraph;
pub use module::{GradientModule, ModuleHandle, Nonlinearity, ParamGroup};
pub use pca::PcaGradientEstimator;
pub use topology::{StackedTopology, TopologyOptions};
pub use trainer::{PhaseKind, PhaseReport, PhaseSpec, StagedTrainer, TrainerOptions};
