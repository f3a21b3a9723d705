//! Backbone capability records and the feature-extractor seam.
//!
//! The convolutional backbone itself is an external collaborator. What the
//! rest of the workspace needs from it is captured by two things:
//!
//! - [`BackboneSpec`]: the widths a model built on top of the backbone must
//!   use, resolved once from a [`BackboneKind`] at construction time.
//! - [`FeatureExtractor`]: anything that maps a `[C, H, W]` pixel patch to a
//!   fixed-length embedding.
//!
//! [`RandomProjectionBackbone`] is a frozen, seeded extractor used for
//! synthetic runs and tests.

use ndarray::{Array1, Array2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{NnError, NnResult};

/// Backbone families the pipeline knows how to size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    /// ResNet-34, 512-wide pooled features.
    Resnet34,
    /// ResNet-101, 2048-wide pooled features.
    Resnet101,
    /// ConvNeXt-Tiny, 768-wide pooled features.
    ConvnextTiny,
    /// Frozen random projection, width given explicitly.
    RandomProjection {
        /// Output width.
        width: usize,
    },
}

impl BackboneKind {
    /// Width of the pooled feature vector this backbone emits.
    pub fn feature_width(self) -> usize {
        match self {
            BackboneKind::Resnet34 => 512,
            BackboneKind::Resnet101 => 2048,
            BackboneKind::ConvnextTiny => 768,
            BackboneKind::RandomProjection { width } => width,
        }
    }

    /// Square input side length the backbone is trained at.
    pub fn input_size(self) -> usize {
        224
    }

    /// Short name used in output directory layout.
    pub fn name(self) -> &'static str {
        match self {
            BackboneKind::Resnet34 => "resnet34",
            BackboneKind::Resnet101 => "resnet101",
            BackboneKind::ConvnextTiny => "convnext_tiny",
            BackboneKind::RandomProjection { .. } => "random_projection",
        }
    }

    /// Resolve the capability record for a model on top of this backbone.
    ///
    /// With `embedding = true` the aggregator re-embeds backbone features into
    /// a `hidden_width` space; otherwise attention runs directly on the
    /// backbone features.
    pub fn resolve(self, hidden_width: usize, class_count: usize, embedding: bool) -> BackboneSpec {
        let feature_width = self.feature_width();
        BackboneSpec {
            feature_width,
            embedding_width: if embedding { hidden_width } else { feature_width },
            hidden_width,
            class_count,
        }
    }

    /// Seeded random-projection extractor with this backbone's feature width.
    ///
    /// Used by the binaries when no external extractor is injected; pooled
    /// on an 8 × 8 grid.
    pub fn stand_in_extractor(self, seed: u64) -> NnResult<RandomProjectionBackbone> {
        RandomProjectionBackbone::new(3, 8, self.feature_width(), seed)
    }
}

/// Widths derived from a backbone and the model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneSpec {
    /// Width of the raw backbone features.
    pub feature_width: usize,
    /// Width `E` (= `L`) of the per-patch embeddings seen by attention.
    pub embedding_width: usize,
    /// Width `D` of the attention hidden layer.
    pub hidden_width: usize,
    /// Number of output classes `K`.
    pub class_count: usize,
}

/// A frozen patch encoder.
///
/// Implementations must be `Send + Sync`: slides and batches are encoded in
/// parallel with shared read-only access.
pub trait FeatureExtractor: Send + Sync {
    /// Length of the vector returned by [`FeatureExtractor::forward`].
    fn embedding_width(&self) -> usize;

    /// Encode one `[C, H, W]` patch.
    fn forward(&self, patch: ArrayView3<'_, f32>) -> NnResult<Array1<f32>>;

    /// Encode a batch of patches into a `[N, embedding_width]` matrix, in
    /// input order.
    fn forward_batch(&self, patches: &[ArrayView3<'_, f32>]) -> NnResult<Array2<f32>> {
        let rows: Vec<Array1<f32>> = patches
            .par_iter()
            .map(|p| self.forward(p.view()))
            .collect::<NnResult<_>>()?;
        let width = self.embedding_width();
        let mut out = Array2::zeros((rows.len(), width));
        for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(rows.iter()) {
            if src.len() != width {
                return Err(NnError::shape("FeatureExtractor::forward_batch", vec![width], vec![src.len()]));
            }
            dst.assign(src);
        }
        Ok(out)
    }
}

/// Average-pools a patch onto a coarse grid and projects it with a fixed
/// Gaussian matrix followed by `tanh`.
#[derive(Debug, Clone)]
pub struct RandomProjectionBackbone {
    channels: usize,
    grid: usize,
    projection: Array2<f32>,
}

impl RandomProjectionBackbone {
    /// Build an extractor for `channels`-channel patches pooled to
    /// `grid × grid` cells and projected to `width` features.
    pub fn new(channels: usize, grid: usize, width: usize, seed: u64) -> NnResult<Self> {
        if channels == 0 || grid == 0 || width == 0 {
            return Err(NnError::invalid_config(
                "RandomProjectionBackbone",
                "channels, grid and width must be > 0",
            ));
        }
        let fan_in = channels * grid * grid;
        let std = (1.0 / fan_in as f32).sqrt();
        let normal = Normal::new(0.0, std)
            .map_err(|e| NnError::invalid_config("RandomProjectionBackbone", e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let projection = Array2::from_shape_fn((width, fan_in), |_| normal.sample(&mut rng));
        Ok(RandomProjectionBackbone { channels, grid, projection })
    }

    fn pool(&self, patch: ArrayView3<'_, f32>) -> Array1<f32> {
        let (c, h, w) = patch.dim();
        let g = self.grid;
        let mut pooled = Array1::zeros(self.channels * g * g);
        for ch in 0..c.min(self.channels) {
            for gy in 0..g {
                let y0 = gy * h / g;
                let y1 = ((gy + 1) * h / g).max(y0 + 1).min(h);
                for gx in 0..g {
                    let x0 = gx * w / g;
                    let x1 = ((gx + 1) * w / g).max(x0 + 1).min(w);
                    let mut sum = 0.0f32;
                    for y in y0..y1 {
                        for x in x0..x1 {
                            sum += patch[[ch, y, x]];
                        }
                    }
                    let count = ((y1 - y0) * (x1 - x0)).max(1) as f32;
                    pooled[(ch * g + gy) * g + gx] = sum / count;
                }
            }
        }
        pooled
    }
}

impl FeatureExtractor for RandomProjectionBackbone {
    fn embedding_width(&self) -> usize {
        self.projection.nrows()
    }

    fn forward(&self, patch: ArrayView3<'_, f32>) -> NnResult<Array1<f32>> {
        let (c, h, w) = patch.dim();
        if c != self.channels || h == 0 || w == 0 {
            return Err(NnError::shape(
                "RandomProjectionBackbone::forward",
                vec![self.channels, h.max(1), w.max(1)],
                vec![c, h, w],
            ));
        }
        let pooled = self.pool(patch);
        Ok(self.projection.dot(&pooled).mapv(f32::tanh))
    }
}
