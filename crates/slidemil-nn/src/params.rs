//! Named parameters and the checkpoint artifact.
//!
//! Every trainable module exposes its tensors through [`Parameterized`] as
//! `(name, view)` pairs in a fixed order. Two modules built from the same
//! configuration therefore produce identical name lists, which is what the
//! momentum update and the checkpoint loader rely on.
//!
//! [`ParamStore`] is the on-disk form: a JSON map from parameter name to a
//! flat row-major tensor with its shape. Loading is non-strict by default:
//! missing and unexpected keys are reported and logged, the rest is copied.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{NnError, NnResult};

/// A borrowed, named, read-only tensor.
pub type NamedView<'a> = (String, ArrayViewD<'a, f32>);

/// A borrowed, named, mutable tensor.
pub type NamedViewMut<'a> = (String, ArrayViewMutD<'a, f32>);

/// Gradients keyed by parameter name, in the same order as
/// [`Parameterized::parameters`].
pub type Gradients = Vec<(String, ArrayD<f32>)>;

/// A module with named learnable parameters and optional non-learnable
/// buffers (e.g. batch-norm running statistics).
pub trait Parameterized {
    /// Learnable tensors in a stable order.
    fn parameters(&self) -> Vec<NamedView<'_>>;

    /// Mutable access to the learnable tensors, same order as
    /// [`Parameterized::parameters`].
    fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>>;

    /// Non-learnable state that is persisted but never optimised.
    fn buffers(&self) -> Vec<NamedView<'_>> {
        Vec::new()
    }

    /// Mutable access to the buffers.
    fn buffers_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        Vec::new()
    }

    /// Total number of learnable scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|(_, v)| v.len()).sum()
    }
}

/// Prefix every name in `views` with `prefix.`.
pub fn prefixed<V>(prefix: &str, views: Vec<(String, V)>) -> Vec<(String, V)> {
    views
        .into_iter()
        .map(|(name, v)| (format!("{prefix}.{name}"), v))
        .collect()
}

// ---------------------------------------------------------------------------
// ParamStore
// ---------------------------------------------------------------------------

/// One serialised tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl StoredTensor {
    fn from_view(view: &ArrayViewD<'_, f32>) -> Self {
        StoredTensor {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        }
    }

    /// Rebuild the tensor as an owned array.
    pub fn to_array(&self) -> NnResult<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|_| {
            NnError::shape("stored tensor", self.shape.clone(), vec![self.data.len()])
        })
    }
}

/// Serialisable mapping from parameter name to tensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamStore {
    tensors: BTreeMap<String, StoredTensor>,
}

/// How strictly [`ParamStore::load_into`] treats key mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Any missing, unexpected or mis-shaped key is an error and nothing is
    /// copied.
    Strict,
    /// Copy what matches, report the rest.
    NonStrict,
}

/// Outcome of a checkpoint load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys copied into the module.
    pub loaded: Vec<String>,
    /// Keys the module has that the checkpoint lacks.
    pub missing: Vec<String>,
    /// Keys the checkpoint has that the module lacks.
    pub unexpected: Vec<String>,
    /// Keys present on both sides with different shapes (not copied).
    pub shape_mismatched: Vec<String>,
}

impl LoadReport {
    /// `true` when every module tensor was restored and nothing was left over.
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.shape_mismatched.is_empty()
    }
}

impl ParamStore {
    /// Snapshot parameters and buffers of `module`.
    pub fn from_module<M: Parameterized + ?Sized>(module: &M) -> Self {
        let mut tensors = BTreeMap::new();
        for (name, view) in module.parameters().iter().chain(module.buffers().iter()) {
            tensors.insert(name.clone(), StoredTensor::from_view(view));
        }
        ParamStore { tensors }
    }

    /// Number of stored tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// `true` when the store holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&StoredTensor> {
        self.tensors.get(name)
    }

    /// Insert or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: StoredTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Remove a tensor, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<StoredTensor> {
        self.tensors.remove(name)
    }

    /// Iterate over stored names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Write the store as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> NnResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| NnError::CheckpointIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string(self).map_err(|source| NnError::CheckpointFormat {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| NnError::CheckpointIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a store previously written by [`ParamStore::save`].
    pub fn load(path: &Path) -> NnResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| NnError::CheckpointIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| NnError::CheckpointFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Copy stored tensors into `module`.
    ///
    /// In [`LoadMode::NonStrict`] the load always succeeds and every skipped
    /// key is logged at `warn` level, since a silently skipped layer keeps its
    /// random initialisation.
    pub fn load_into<M: Parameterized + ?Sized>(
        &self,
        module: &mut M,
        mode: LoadMode,
    ) -> NnResult<LoadReport> {
        let mut report = LoadReport::default();

        // First pass: classify without mutating so strict mode is atomic.
        for (name, view) in module.parameters().iter().chain(module.buffers().iter()) {
            match self.tensors.get(name) {
                None => report.missing.push(name.clone()),
                Some(stored) if stored.shape != view.shape() => {
                    report.shape_mismatched.push(name.clone())
                }
                Some(_) => report.loaded.push(name.clone()),
            }
        }
        for key in self.tensors.keys() {
            let known = report.loaded.iter().any(|n| n == key)
                || report.missing.iter().any(|n| n == key)
                || report.shape_mismatched.iter().any(|n| n == key);
            if !known {
                report.unexpected.push(key.clone());
            }
        }

        if mode == LoadMode::Strict && !report.is_exact() {
            return Err(NnError::StrictLoad {
                missing: report.missing.len(),
                unexpected: report.unexpected.len(),
                mismatched: report.shape_mismatched.len(),
            });
        }

        let copied = copy_matching(self, module.parameters_mut(), &report.loaded)
            + copy_matching(self, module.buffers_mut(), &report.loaded);

        if !report.is_exact() {
            warn!(
                missing = ?report.missing,
                unexpected = ?report.unexpected,
                shape_mismatched = ?report.shape_mismatched,
                "Non-strict checkpoint load: some keys were skipped"
            );
        }
        info!("Restored {} of {} tensors from checkpoint", copied, self.tensors.len());
        Ok(report)
    }
}

fn copy_matching(store: &ParamStore, targets: Vec<NamedViewMut<'_>>, allowed: &[String]) -> usize {
    let mut copied = 0;
    for (name, mut view) in targets {
        if !allowed.iter().any(|n| n == &name) {
            continue;
        }
        if let Some(stored) = store.tensors.get(&name) {
            for (dst, src) in view.iter_mut().zip(stored.data.iter()) {
                *dst = *src;
            }
            copied += 1;
        }
    }
    copied
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use tempfile::tempdir;

    struct Toy {
        w: Array2<f32>,
        b: Array1<f32>,
    }

    impl Parameterized for Toy {
        fn parameters(&self) -> Vec<NamedView<'_>> {
            vec![
                ("w".to_string(), self.w.view().into_dyn()),
                ("b".to_string(), self.b.view().into_dyn()),
            ]
        }
        fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
            vec![
                ("w".to_string(), self.w.view_mut().into_dyn()),
                ("b".to_string(), self.b.view_mut().into_dyn()),
            ]
        }
    }

    fn toy(fill: f32) -> Toy {
        Toy { w: Array2::from_elem((2, 3), fill), b: Array1::from_elem(2, fill) }
    }

    #[test]
    fn save_and_load_restores_values() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("toy.json");
        ParamStore::from_module(&toy(1.5)).save(&path).unwrap();

        let mut target = toy(0.0);
        let report = ParamStore::load(&path)
            .unwrap()
            .load_into(&mut target, LoadMode::Strict)
            .unwrap();
        assert!(report.is_exact());
        assert!(target.w.iter().all(|&v| v == 1.5));
        assert!(target.b.iter().all(|&v| v == 1.5));
    }

    #[test]
    fn non_strict_load_skips_missing_and_unexpected() {
        let mut store = ParamStore::from_module(&toy(2.0));
        store.remove("b");
        store.insert("extra", StoredTensor { shape: vec![1], data: vec![9.0] });

        let mut target = toy(0.0);
        let report = store.load_into(&mut target, LoadMode::NonStrict).unwrap();
        assert_eq!(report.loaded, vec!["w".to_string()]);
        assert_eq!(report.missing, vec!["b".to_string()]);
        assert_eq!(report.unexpected, vec!["extra".to_string()]);
        assert!(target.w.iter().all(|&v| v == 2.0));
        assert!(target.b.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn strict_load_rejects_mismatch_without_mutating() {
        let mut store = ParamStore::from_module(&toy(3.0));
        store.insert("w", StoredTensor { shape: vec![3, 2], data: vec![3.0; 6] });

        let mut target = toy(0.0);
        let err = store.load_into(&mut target, LoadMode::Strict).unwrap_err();
        assert!(matches!(err, NnError::StrictLoad { mismatched: 1, .. }));
        assert!(target.b.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn num_parameters_counts_all_scalars() {
        assert_eq!(toy(0.0).num_parameters(), 8);
    }
}
