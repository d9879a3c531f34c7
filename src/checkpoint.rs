//! Parameter checkpointing.
//!
//! A checkpoint is the flat dump of every parameter group in the topology
//! under a tag. Tags mark schedule milestones; restoring is an operator
//! action, never automatic.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::topology::StackedTopology;

pub const TAG_AFTER_INIT: &str = "afterinit";
pub const TAG_AFTER_PRETRAINING: &str = "afterpretraining";
pub const TAG_FINAL: &str = "final";

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    tag: String,
    saved_at: String,
    groups: Vec<SavedGroup>,
}

#[derive(Serialize, Deserialize)]
struct SavedGroup {
    name: String,
    values: Vec<f32>,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.ckpt"))
    }

    pub fn save(&self, tag: &str, topology: &StackedTopology) -> Result<PathBuf> {
        let groups = topology
            .param_groups()
            .iter()
            .map(|g| SavedGroup {
                name: g.name().to_string(),
                values: g.data().clone(),
            })
            .collect();
        let checkpoint = Checkpoint {
            tag: tag.to_string(),
            saved_at: Utc::now().to_rfc3339(),
            groups,
        };
        let bytes = bincode::serialize(&checkpoint)
            .map_err(|e| Error::checkpoint(format!("encode {tag}: {e}")))?;
        let path = self.path(tag);
        fs::write(&path, bytes)?;
        info!(tag, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    pub fn load(&self, tag: &str, topology: &StackedTopology) -> Result<()> {
        Self::load_file(&self.path(tag), topology)
    }

    /// Restore parameters from an arbitrary checkpoint file. The file must
    /// carry exactly the topology's groups, in order and with matching
    /// sizes.
    pub fn load_file(path: &Path, topology: &StackedTopology) -> Result<()> {
        let bytes = fs::read(path)?;
        let checkpoint: Checkpoint = bincode::deserialize(&bytes)
            .map_err(|e| Error::checkpoint(format!("decode {}: {e}", path.display())))?;
        let groups = topology.param_groups();
        if checkpoint.groups.len() != groups.len() {
            return Err(Error::checkpoint(format!(
                "{}: {} parameter groups, topology has {}",
                path.display(),
                checkpoint.groups.len(),
                groups.len()
            )));
        }
        for (saved, group) in checkpoint.groups.iter().zip(groups.iter()) {
            if saved.values.len() != group.len() {
                return Err(Error::checkpoint(format!(
                    "{}: group {} has {} values, topology expects {}",
                    path.display(),
                    saved.name,
                    saved.values.len(),
                    group.len()
                )));
            }
            group.data_mut().copy_from_slice(&saved.values);
            group.zero_grad();
        }
        info!(tag = checkpoint.tag, path = %path.display(), "checkpoint restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyOptions;

    fn topology() -> StackedTopology {
        StackedTopology::new(vec![4, 3, 2], TopologyOptions::default()).unwrap()
    }

    #[test]
    fn save_then_load_restores_exact_values() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let topo = topology();
        let before: Vec<Vec<f32>> = topo.param_groups().iter().map(|g| g.data().clone()).collect();

        manager.save(TAG_AFTER_INIT, &topo).unwrap();
        for g in topo.param_groups() {
            for v in g.data_mut().iter_mut() {
                *v += 1.0;
            }
        }
        manager.load(TAG_AFTER_INIT, &topo).unwrap();

        let after: Vec<Vec<f32>> = topo.param_groups().iter().map(|g| g.data().clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn mismatched_topology_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let topo = topology();
        manager.save(TAG_FINAL, &topo).unwrap();

        let other = StackedTopology::new(vec![5, 3, 2], TopologyOptions::default()).unwrap();
        assert!(manager.load(TAG_FINAL, &other).is_err());
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        assert!(manager.load("nope", &topology()).is_err());
    }
}
