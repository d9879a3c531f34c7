//! Phase descriptors: value objects handed to the trainer.
//!
//! A phase fully describes one stage of the training schedule: which graph
//! view runs, which losses attach to it, how gradient flow is restricted
//! and the epoch schedule. The trainer keeps no state between phases.

use serde::{Deserialize, Serialize};

/// Which graph/loss pairing a phase drives and how backward is restricted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseKind {
    /// Per-layer reconstruction pretraining, each layer run to convergence
    /// in turn. `cumulative` routes each layer's input through the plain
    /// chain below it instead of a precomputed representation; `include`
    /// restricts the sweep to a subset of layers.
    LayerwiseUnsupervised {
        #[serde(default)]
        cumulative: bool,
        #[serde(default)]
        include: Option<Vec<bool>>,
    },
    /// All included layers' reconstruction branches trained concurrently on
    /// one selective graph. With `propagate_down` false, gradient is cut at
    /// every layer boundary at once.
    SelectiveSubset {
        include: Vec<bool>,
        #[serde(default)]
        propagate_down: bool,
    },
    /// Every reconstruction branch at once, no classifier in the loss
    /// unless `with_classifier`; in that case the classifier trains on its
    /// own segment but is detached from the body.
    Unsupervised {
        #[serde(default)]
        with_classifier: bool,
    },
    /// Supervised plus all reconstruction losses concatenated. The
    /// supervised weight is pinned at 1.0; `unsup_weight` scales every
    /// reconstruction term. `adaptive_weights` re-derives the weights from
    /// gradient variance before each epoch.
    Joint {
        unsup_weight: f32,
        #[serde(default)]
        detach_classifier: bool,
        #[serde(default)]
        adaptive_weights: bool,
    },
    /// Plain supervised training. With `layer_rates`, the single update is
    /// replaced by one call per encoder plus one for the classifier; a rate
    /// of zero or below freezes that layer.
    Supervised {
        #[serde(default)]
        layer_rates: Option<Vec<f32>>,
    },
    /// Supervised training with backward truncated to the classifier and
    /// the top `k - 1` encoders; lower encoders are never touched.
    TopK { k: usize },
}

impl PhaseKind {
    /// Whether this phase belongs to the pretraining stage of a schedule.
    pub fn is_pretraining(&self) -> bool {
        matches!(
            self,
            PhaseKind::LayerwiseUnsupervised { .. }
                | PhaseKind::SelectiveSubset { .. }
                | PhaseKind::Unsupervised { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::LayerwiseUnsupervised { .. } => "layerwise-unsupervised",
            PhaseKind::SelectiveSubset { .. } => "selective-subset",
            PhaseKind::Unsupervised { .. } => "unsupervised",
            PhaseKind::Joint { .. } => "joint",
            PhaseKind::Supervised { .. } => "supervised",
            PhaseKind::TopK { .. } => "top-k",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    #[serde(flatten)]
    pub kind: PhaseKind,
    pub max_epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Per-epoch decay: the effective rate at epoch e is
    /// `learning_rate / (1 + e * rate_decay)`.
    #[serde(default)]
    pub rate_decay: f32,
    /// Relative loss-improvement threshold ending the phase early.
    #[serde(default = "default_end_accuracy")]
    pub end_accuracy: f32,
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_end_accuracy() -> f32 {
    1e-4
}

impl PhaseSpec {
    pub fn new(kind: PhaseKind, max_epochs: usize) -> Self {
        Self {
            kind,
            max_epochs,
            learning_rate: default_learning_rate(),
            rate_decay: 0.0,
            end_accuracy: default_end_accuracy(),
        }
    }

    pub fn with_learning_rate(mut self, rate: f32) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn rate_at(&self, epoch: usize) -> f32 {
        self.learning_rate / (1.0 + epoch as f32 * self.rate_decay)
    }
}

/// Outcome of one phase (or one layer of a layerwise phase).
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: String,
    pub epochs: usize,
    pub final_loss: f32,
    pub converged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_decays_per_epoch() {
        let phase = PhaseSpec::new(
            PhaseKind::Supervised { layer_rates: None },
            10,
        )
        .with_learning_rate(1.0);
        let mut phase = phase;
        phase.rate_decay = 1.0;
        assert_eq!(phase.rate_at(0), 1.0);
        assert_eq!(phase.rate_at(1), 0.5);
        assert_eq!(phase.rate_at(3), 0.25);
    }

    #[test]
    fn phase_spec_parses_from_json() {
        let raw = r#"{"kind": "joint", "unsup_weight": 0.5, "max_epochs": 3}"#;
        let phase: PhaseSpec = serde_json::from_str(raw).unwrap();
        match phase.kind {
            PhaseKind::Joint {
                unsup_weight,
                detach_classifier,
                adaptive_weights,
            } => {
                assert_eq!(unsup_weight, 0.5);
                assert!(!detach_classifier);
                assert!(!adaptive_weights);
            }
            other => panic!("parsed wrong kind: {}", other.name()),
        }
        assert_eq!(phase.max_epochs, 3);
        assert_eq!(phase.learning_rate, 0.01);
    }
}
