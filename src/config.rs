//! Run configuration: topology, trainer and phase schedule.
//!
//! Everything is validated up front; a bad schedule must fail before any
//! computation starts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::topology::TopologyOptions;
use crate::trainer::{PhaseKind, PhaseSpec, ReconstructionLoss, TrainerOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input width, hidden widths, output width.
    pub widths: Vec<usize>,
    #[serde(default)]
    pub topology: TopologyOptions,
    #[serde(default)]
    pub trainer: TrainerOptions,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Start from this checkpoint instead of random initialization.
    /// Incompatible with pretraining phases.
    #[serde(default)]
    pub init_from: Option<PathBuf>,
}

impl Config {
    /// Read a configuration from YAML or JSON, by file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
                .map_err(|e| Error::config(format!("{}: {e}", path.display())))?,
            _ => serde_json::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn n_hidden(&self) -> usize {
        self.widths.len().saturating_sub(2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.widths.len() < 3 {
            return Err(Error::config(format!(
                "widths needs input, at least one hidden and output, got {:?}",
                self.widths
            )));
        }
        if self.widths.iter().any(|&w| w == 0) {
            return Err(Error::config("widths must be nonzero"));
        }
        let n = self.n_hidden();

        if self.trainer.reconstruction_loss == ReconstructionLoss::CrossEntropy
            && !self.topology.reconstruction_activation.bounded_unit()
        {
            return Err(Error::config(
                "cross-entropy reconstruction requires a sigmoid reconstruction activation",
            ));
        }
        if self.trainer.profile_gradients && self.topology.noisy {
            return Err(Error::config(
                "gradient profiling is unavailable with noisy pretraining",
            ));
        }
        if self.init_from.is_some() && self.phases.iter().any(|p| p.kind.is_pretraining()) {
            return Err(Error::config(
                "initializing from a checkpoint excludes pretraining phases",
            ));
        }

        for (idx, phase) in self.phases.iter().enumerate() {
            if phase.max_epochs == 0 {
                return Err(Error::config(format!(
                    "phase {idx} ({}) has no epoch budget",
                    phase.kind.name()
                )));
            }
            match &phase.kind {
                PhaseKind::LayerwiseUnsupervised {
                    include: Some(inc), ..
                }
                | PhaseKind::SelectiveSubset { include: inc, .. } => {
                    if inc.len() != n {
                        return Err(Error::config(format!(
                            "phase {idx}: inclusion list covers {} layers, topology has {n}",
                            inc.len()
                        )));
                    }
                    if !inc.iter().any(|&b| b) {
                        return Err(Error::config(format!(
                            "phase {idx}: inclusion list selects no layer"
                        )));
                    }
                }
                PhaseKind::Supervised {
                    layer_rates: Some(rates),
                } => {
                    if rates.len() != n + 1 {
                        return Err(Error::config(format!(
                            "phase {idx}: {} per-layer rates for {n} encoders plus classifier",
                            rates.len()
                        )));
                    }
                }
                PhaseKind::TopK { k } => {
                    if *k == 0 || *k > n + 1 {
                        return Err(Error::config(format!(
                            "phase {idx}: top-k depth {k} outside 1..={}",
                            n + 1
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base() -> Config {
        Config {
            widths: vec![4, 3, 2],
            topology: TopologyOptions::default(),
            trainer: TrainerOptions::default(),
            phases: Vec::new(),
            checkpoint_dir: None,
            init_from: None,
        }
    }

    #[test]
    fn loads_yaml_schedule() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "widths: [4, 3, 2]\nphases:\n  - kind: layerwise_unsupervised\n    max_epochs: 5\n  - kind: supervised\n    max_epochs: 10\n    learning_rate: 0.05\n"
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.phases.len(), 2);
        assert_eq!(config.phases[1].learning_rate, 0.05);
    }

    #[test]
    fn init_from_excludes_pretraining() {
        let mut config = base();
        config.init_from = Some(PathBuf::from("init.ckpt"));
        config.phases = vec![PhaseSpec::new(
            PhaseKind::Unsupervised {
                with_classifier: false,
            },
            3,
        )];
        assert!(config.validate().is_err());

        config.phases = vec![PhaseSpec::new(PhaseKind::Supervised { layer_rates: None }, 3)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn wrong_inclusion_length_rejected() {
        let mut config = base();
        config.phases = vec![PhaseSpec::new(
            PhaseKind::SelectiveSubset {
                include: vec![true, false],
                propagate_down: false,
            },
            3,
        )];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_epoch_phase_rejected() {
        let mut config = base();
        config.phases = vec![PhaseSpec::new(PhaseKind::TopK { k: 1 }, 0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn mismatched_loss_pairing_rejected() {
        let mut config = base();
        config.trainer.reconstruction_loss = ReconstructionLoss::CrossEntropy;
        config.topology.reconstruction_activation = crate::module::Nonlinearity::Tanh;
        assert!(config.validate().is_err());
    }
}
