//! Online/momentum encoder pair.
//!
//! The momentum encoder is a trailing exponential moving average of the
//! online encoder:
//!
//! ```text
//! θ_momentum ← m · θ_momentum + (1 − m) · θ_online
//! ```
//!
//! [`MomentumEncoder`] owns its module and exposes no mutable access to the
//! parameters, so the EMA in [`MomentumEncoder::update`] is the only way they
//! change. It also hands out no gradient cache, which keeps it out of
//! backpropagation.
//!
//! [`BatchShuffle`] reorders a batch before the momentum encoder sees it and
//! restores the original order afterwards. Because the projection head
//! normalises with batch statistics in training mode, the restore must be
//! exact index for index or the positive pairs no longer line up.

use ndarray::{Array2, ArrayD, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use slidemil_nn::{NnError, NnResult, Parameterized, ProjectionHead};
use std::sync::Arc;

use slidemil_nn::FeatureExtractor;

// ---------------------------------------------------------------------------
// EMA
// ---------------------------------------------------------------------------

/// Apply `momentum ← m·momentum + (1 − m)·online` to every parameter pair.
///
/// `m = 0` copies the online parameters exactly. Fails without modifying
/// anything when `m ∉ [0, 1]` or the parameter layouts differ.
pub fn sync<M: Parameterized + ?Sized>(online: &M, momentum: &mut M, m: f32) -> NnResult<()> {
    if !(0.0..=1.0).contains(&m) {
        return Err(NnError::invalid_config("moco_m", format!("{m} is outside [0, 1]")));
    }
    let source = online.parameters();
    {
        let target = momentum.parameters();
        if source.len() != target.len() {
            return Err(NnError::layout(
                "<module>",
                format!("{} online tensors vs {} momentum tensors", source.len(), target.len()),
            ));
        }
        for ((sn, sv), (tn, tv)) in source.iter().zip(target.iter()) {
            if sn != tn || sv.shape() != tv.shape() {
                return Err(NnError::layout(
                    sn.clone(),
                    format!("online {sn}{:?} vs momentum {tn}{:?}", sv.shape(), tv.shape()),
                ));
            }
        }
    }
    for ((_, src), (_, mut dst)) in source.iter().zip(momentum.parameters_mut()) {
        if m == 0.0 {
            dst.assign(src);
        } else {
            dst.zip_mut_with(src, |d, &s| *d = m * *d + (1.0 - m) * s);
        }
    }
    Ok(())
}

/// A module that only changes through [`sync`].
#[derive(Debug, Clone)]
pub struct MomentumEncoder<M> {
    inner: M,
}

impl<M: Parameterized + Clone> MomentumEncoder<M> {
    /// Start as an exact copy of `online`.
    pub fn new(online: &M) -> NnResult<Self> {
        let mut inner = online.clone();
        sync(online, &mut inner, 0.0)?;
        Ok(MomentumEncoder { inner })
    }

    /// Pull the parameters toward `online` with coefficient `m`.
    pub fn update(&mut self, online: &M, m: f32) -> NnResult<()> {
        sync(online, &mut self.inner, m)
    }

    /// Read-only access to the tracked module.
    pub fn get(&self) -> &M {
        &self.inner
    }

    /// Put the batch-norm running statistics back to `snapshot`. Parameters
    /// are not touched.
    pub fn restore_buffers(&mut self, snapshot: &BufferSnapshot) -> NnResult<()> {
        snapshot.restore(&mut self.inner)
    }
}

/// Owned copy of a module's buffers, in [`Parameterized::buffers`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot(Vec<ArrayD<f32>>);

impl BufferSnapshot {
    /// Copy the current buffers of `module`.
    pub fn take<M: Parameterized + ?Sized>(module: &M) -> Self {
        BufferSnapshot(module.buffers().into_iter().map(|(_, v)| v.to_owned()).collect())
    }

    /// Write the saved values back. Fails without modifying anything when the
    /// layout differs.
    pub fn restore<M: Parameterized + ?Sized>(&self, module: &mut M) -> NnResult<()> {
        let targets = module.buffers_mut();
        if targets.len() != self.0.len() {
            return Err(NnError::layout(
                "<buffers>",
                format!("{} saved tensors vs {} in module", self.0.len(), targets.len()),
            ));
        }
        for ((name, dst), src) in targets.iter().zip(&self.0) {
            if dst.shape() != src.shape() {
                return Err(NnError::layout(
                    name.clone(),
                    format!("saved {:?} vs module {:?}", src.shape(), dst.shape()),
                ));
            }
        }
        for ((_, mut dst), src) in targets.into_iter().zip(&self.0) {
            dst.assign(src);
        }
        Ok(())
    }
}

impl MomentumEncoder<ProjectionHead> {
    /// Training-mode projection. Batch-norm running statistics advance, but
    /// no gradient cache is returned.
    pub fn project(&mut self, x: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        let (out, _cache) = self.inner.forward_train(x)?;
        Ok(out)
    }
}

/// Frozen backbone shared by both encoders plus the two projection heads.
pub struct EncoderPair {
    backbone: Arc<dyn FeatureExtractor>,
    online: ProjectionHead,
    momentum: MomentumEncoder<ProjectionHead>,
}

impl EncoderPair {
    /// Build a pair; the momentum head starts as an exact copy of `online`.
    pub fn new(backbone: Arc<dyn FeatureExtractor>, online: ProjectionHead) -> NnResult<Self> {
        if backbone.embedding_width() != online.config().in_width {
            return Err(NnError::invalid_config(
                "projection.in_width",
                format!(
                    "backbone emits {} features, head expects {}",
                    backbone.embedding_width(),
                    online.config().in_width
                ),
            ));
        }
        let momentum = MomentumEncoder::new(&online)?;
        Ok(EncoderPair { backbone, online, momentum })
    }

    /// Shared frozen backbone.
    pub fn backbone(&self) -> &dyn FeatureExtractor {
        self.backbone.as_ref()
    }

    /// Online head.
    pub fn online(&self) -> &ProjectionHead {
        &self.online
    }

    /// Mutable online head, for the optimiser.
    pub fn online_mut(&mut self) -> &mut ProjectionHead {
        &mut self.online
    }

    /// Momentum head.
    pub fn momentum(&self) -> &MomentumEncoder<ProjectionHead> {
        &self.momentum
    }

    /// Mutable momentum wrapper (forward passes and EMA only).
    pub fn momentum_mut(&mut self) -> &mut MomentumEncoder<ProjectionHead> {
        &mut self.momentum
    }

    /// EMA step of the momentum head toward the online head.
    pub fn sync(&mut self, m: f32) -> NnResult<()> {
        self.momentum.update(&self.online, m)
    }
}

// ---------------------------------------------------------------------------
// BatchShuffle
// ---------------------------------------------------------------------------

/// A batch permutation with its inverse.
///
/// `apply` produces `shuffled[a] = x[perm[a]]`; `restore` writes row `a` of
/// its input back to position `perm[a]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchShuffle {
    perm: Vec<usize>,
}

impl BatchShuffle {
    /// Uniformly random permutation of `0..n`.
    pub fn random<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Self {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(rng);
        BatchShuffle { perm }
    }

    /// Use an explicit permutation. Fails unless `perm` holds each of
    /// `0..perm.len()` exactly once.
    pub fn from_permutation(perm: Vec<usize>) -> NnResult<Self> {
        let mut seen = vec![false; perm.len()];
        for &p in &perm {
            match seen.get_mut(p) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(NnError::invalid_config(
                        "permutation",
                        format!("{p} is out of range or repeated"),
                    ))
                }
            }
        }
        Ok(BatchShuffle { perm })
    }

    /// Batch size this permutation applies to.
    pub fn len(&self) -> usize {
        self.perm.len()
    }

    /// `true` for the empty permutation.
    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// The permutation itself.
    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }

    /// Reorder rows: `out[a] = x[perm[a]]`.
    pub fn apply(&self, x: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        self.check(x.nrows())?;
        Ok(x.select(Axis(0), &self.perm))
    }

    /// Undo [`BatchShuffle::apply`]: `out[perm[a]] = y[a]`.
    pub fn restore(&self, y: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        self.check(y.nrows())?;
        let mut out = Array2::zeros(y.raw_dim());
        for (a, &j) in self.perm.iter().enumerate() {
            out.row_mut(j).assign(&y.row(a));
        }
        Ok(out)
    }

    /// Apply to any per-sample slice, e.g. a list of patch views.
    pub fn apply_slice<T: Clone>(&self, items: &[T]) -> NnResult<Vec<T>> {
        self.check(items.len())?;
        Ok(self.perm.iter().map(|&i| items[i].clone()).collect())
    }

    fn check(&self, rows: usize) -> NnResult<()> {
        if rows != self.perm.len() {
            return Err(NnError::shape("BatchShuffle", vec![self.perm.len()], vec![rows]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use slidemil_nn::{Linear, ProjectionConfig};

    fn head(seed: u64) -> ProjectionHead {
        ProjectionHead::new(
            ProjectionConfig { in_width: 6, hidden_width: 5, out_width: 3 },
            &mut StdRng::seed_from_u64(seed),
        )
        .unwrap()
    }

    #[test]
    fn sync_with_zero_copies_bit_for_bit() {
        let online = head(1);
        let mut momentum = head(2);
        sync(&online, &mut momentum, 0.0).unwrap();
        for ((_, a), (_, b)) in online.parameters().iter().zip(momentum.parameters().iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn buffer_snapshot_undoes_running_statistics_only() {
        let online = head(5);
        let mut enc = MomentumEncoder::new(&online).unwrap();
        let saved = BufferSnapshot::take(enc.get());
        let params_before = enc.get().clone();

        let x = Array2::from_shape_fn((4, 6), |(i, j)| (i * 6 + j) as f32 * 0.1);
        enc.project(x.view()).unwrap();
        assert_ne!(BufferSnapshot::take(enc.get()), saved);

        enc.restore_buffers(&saved).unwrap();
        assert_eq!(BufferSnapshot::take(enc.get()), saved);
        assert_eq!(enc.get(), &params_before);
    }

    #[test]
    fn buffer_snapshot_rejects_other_layouts() {
        let saved = BufferSnapshot::take(&head(1));
        let mut other = ProjectionHead::new(
            ProjectionConfig { in_width: 6, hidden_width: 7, out_width: 3 },
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
        assert!(saved.restore(&mut other).is_err());
    }

    #[test]
    fn sync_applies_ema_elementwise() {
        let online = Linear::from_parts(
            ndarray::array![[1.0, 2.0], [3.0, 4.0]],
            ndarray::array![0.5, -0.5],
        )
        .unwrap();
        let mut momentum = Linear::zeros(2, 2);
        sync(&online, &mut momentum, 0.9).unwrap();
        assert_abs_diff_eq!(momentum.weight()[[1, 0]], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(momentum.bias()[1], -0.05, epsilon = 1e-6);

        sync(&online, &mut momentum, 0.9).unwrap();
        // 0.9 * 0.3 + 0.1 * 3.0
        assert_abs_diff_eq!(momentum.weight()[[1, 0]], 0.57, epsilon = 1e-6);
    }

    #[test]
    fn sync_with_one_leaves_momentum_unchanged() {
        let online = head(3);
        let mut momentum = head(4);
        let before = momentum.clone();
        sync(&online, &mut momentum, 1.0).unwrap();
        for ((_, a), (_, b)) in before.parameters().iter().zip(momentum.parameters().iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn sync_rejects_out_of_range_coefficient_and_layout_mismatch() {
        let online = Linear::zeros(3, 2);
        let mut momentum = Linear::zeros(3, 2);
        assert!(sync(&online, &mut momentum, 1.5).is_err());
        let mut other = Linear::zeros(4, 2);
        assert!(matches!(sync(&online, &mut other, 0.5), Err(NnError::LayoutMismatch { .. })));
    }

    #[test]
    fn momentum_encoder_starts_identical() {
        let online = head(5);
        let momentum = MomentumEncoder::new(&online).unwrap();
        for ((_, a), (_, b)) in online.parameters().iter().zip(momentum.get().parameters().iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn shuffle_then_restore_is_identity() {
        let x = Array2::from_shape_fn((7, 3), |(i, j)| (i * 10 + j) as f32);
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..5 {
            let sh = BatchShuffle::random(7, &mut rng);
            let shuffled = sh.apply(x.view()).unwrap();
            for (a, &p) in sh.permutation().iter().enumerate() {
                assert_eq!(shuffled.row(a), x.row(p));
            }
            assert_eq!(sh.restore(shuffled.view()).unwrap(), x);
        }
    }

    #[test]
    fn explicit_permutation_is_validated() {
        assert!(BatchShuffle::from_permutation(vec![2, 0, 1]).is_ok());
        assert!(BatchShuffle::from_permutation(vec![0, 0, 1]).is_err());
        assert!(BatchShuffle::from_permutation(vec![0, 3]).is_err());
    }

    #[test]
    fn restore_rejects_wrong_batch_size() {
        let sh = BatchShuffle::from_permutation(vec![1, 0]).unwrap();
        assert!(sh.restore(Array2::zeros((3, 2)).view()).is_err());
    }
}
