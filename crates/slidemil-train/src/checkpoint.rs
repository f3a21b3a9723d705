//! Best / temporary encoder checkpoints.
//!
//! Only the online encoder's parameters and buffers are persisted; optimiser
//! state is not. Both files live in the run's checkpoint directory.

use slidemil_nn::{ParamStore, Parameterized};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::TrainResult;

/// File name of the best encoder so far.
pub const BEST_FILE: &str = "moco_encoder.json";
/// File name of the latest non-improving encoder.
pub const TEMPORARY_FILE: &str = "moco_encoder_temporary.json";

/// Which file a checkpoint went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// New best running loss.
    Best,
    /// No improvement; latest weights only.
    Temporary,
}

/// Writes encoder snapshots under one directory.
#[derive(Debug, Clone)]
pub struct EncoderCheckpointer {
    dir: PathBuf,
}

impl EncoderCheckpointer {
    /// Checkpoints go to `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        EncoderCheckpointer { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the best-encoder file.
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE)
    }

    /// Path of the temporary-encoder file.
    pub fn temporary_path(&self) -> PathBuf {
        self.dir.join(TEMPORARY_FILE)
    }

    /// Snapshot `encoder` into the file for `kind`.
    pub fn save<M: Parameterized + ?Sized>(&self, encoder: &M, kind: CheckpointKind) -> TrainResult<PathBuf> {
        let path = match kind {
            CheckpointKind::Best => self.best_path(),
            CheckpointKind::Temporary => self.temporary_path(),
        };
        ParamStore::from_module(encoder).save(&path)?;
        info!("Saved {:?} encoder checkpoint to {}", kind, path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use slidemil_nn::{LoadMode, ProjectionConfig, ProjectionHead};
    use tempfile::tempdir;

    #[test]
    fn best_and_temporary_go_to_separate_files() {
        let tmp = tempdir().unwrap();
        let ckpt = EncoderCheckpointer::new(tmp.path().join("20x").join("resnet34"));
        let head = ProjectionHead::new(
            ProjectionConfig { in_width: 4, hidden_width: 4, out_width: 2 },
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

        let best = ckpt.save(&head, CheckpointKind::Best).unwrap();
        let temp = ckpt.save(&head, CheckpointKind::Temporary).unwrap();
        assert!(best.ends_with(BEST_FILE) && best.exists());
        assert!(temp.ends_with(TEMPORARY_FILE) && temp.exists());

        let mut restored = ProjectionHead::new(head.config(), &mut StdRng::seed_from_u64(9)).unwrap();
        let report = ParamStore::load(&best).unwrap().load_into(&mut restored, LoadMode::Strict).unwrap();
        assert!(report.is_exact());
        assert_eq!(restored, head);
    }
}
