//! Contrastive projection head.
//!
//! ```text
//! features [N, L] ──► fc1 ──► BatchNorm1d ──► ReLU ──► fc2 ──► [N, d]
//! ```
//!
//! In training mode the batch-norm layer normalises with statistics of the
//! current batch, so every output row depends on every input row of the
//! batch. Key encoding must therefore go through a batch shuffle.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{NnError, NnResult};
use crate::linear::Linear;
use crate::params::{prefixed, Gradients, NamedView, NamedViewMut, Parameterized};

// ---------------------------------------------------------------------------
// BatchNorm1d
// ---------------------------------------------------------------------------

/// Per-feature batch normalisation with a learned affine transform.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm1d {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    momentum: f32,
    eps: f32,
}

/// Values saved by [`BatchNorm1d::forward_train`] for the backward pass.
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
}

impl BatchNorm1d {
    /// Identity-initialised layer (`γ = 1`, `β = 0`).
    pub fn new(width: usize) -> Self {
        BatchNorm1d {
            gamma: Array1::ones(width),
            beta: Array1::zeros(width),
            running_mean: Array1::zeros(width),
            running_var: Array1::ones(width),
            momentum: 0.1,
            eps: 1e-5,
        }
    }

    /// Normalise with batch statistics and update the running estimates.
    pub fn forward_train(&mut self, x: ArrayView2<'_, f32>) -> NnResult<(Array2<f32>, BatchNormCache)> {
        let n = x.nrows();
        if n < 2 {
            return Err(NnError::invalid_config(
                "batch_size",
                "batch normalisation needs at least 2 rows in training mode",
            ));
        }
        let mean = x.mean_axis(Axis(0)).ok_or(NnError::EmptyBag)?;
        let centered = &x - &mean;
        let var = centered.mapv(|v| v * v).mean_axis(Axis(0)).ok_or(NnError::EmptyBag)?;
        let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let x_hat = &centered * &inv_std;
        let y = &x_hat * &self.gamma + &self.beta;

        let unbiased = &var * (n as f32 / (n - 1) as f32);
        self.running_mean = &self.running_mean * (1.0 - self.momentum) + &mean * self.momentum;
        self.running_var = &self.running_var * (1.0 - self.momentum) + &unbiased * self.momentum;

        Ok((y, BatchNormCache { x_hat, inv_std }))
    }

    /// Normalise with the running estimates.
    pub fn forward_eval(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let inv_std = self.running_var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        (&x - &self.running_mean) * &inv_std * &self.gamma + &self.beta
    }

    /// Returns `(∂L/∂x, ∂L/∂γ, ∂L/∂β)`.
    pub fn backward(
        &self,
        cache: &BatchNormCache,
        grad_out: ArrayView2<'_, f32>,
    ) -> (Array2<f32>, Array1<f32>, Array1<f32>) {
        let n = grad_out.nrows() as f32;
        let d_gamma = (&grad_out * &cache.x_hat).sum_axis(Axis(0));
        let d_beta = grad_out.sum_axis(Axis(0));
        let d_xhat = &grad_out * &self.gamma;
        let sum_dxhat = d_xhat.sum_axis(Axis(0));
        let sum_dxhat_xhat = (&d_xhat * &cache.x_hat).sum_axis(Axis(0));
        let d_x = (&d_xhat * n - &sum_dxhat - &cache.x_hat * &sum_dxhat_xhat) * &cache.inv_std / n;
        (d_x, d_gamma, d_beta)
    }
}

impl Parameterized for BatchNorm1d {
    fn parameters(&self) -> Vec<NamedView<'_>> {
        vec![
            ("weight".to_string(), self.gamma.view().into_dyn()),
            ("bias".to_string(), self.beta.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        vec![
            ("weight".to_string(), self.gamma.view_mut().into_dyn()),
            ("bias".to_string(), self.beta.view_mut().into_dyn()),
        ]
    }

    fn buffers(&self) -> Vec<NamedView<'_>> {
        vec![
            ("running_mean".to_string(), self.running_mean.view().into_dyn()),
            ("running_var".to_string(), self.running_var.view().into_dyn()),
        ]
    }

    fn buffers_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        vec![
            ("running_mean".to_string(), self.running_mean.view_mut().into_dyn()),
            ("running_var".to_string(), self.running_var.view_mut().into_dyn()),
        ]
    }
}

// ---------------------------------------------------------------------------
// ProjectionHead
// ---------------------------------------------------------------------------

/// Widths of a [`ProjectionHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Backbone feature width `L`.
    pub in_width: usize,
    /// Hidden width.
    pub hidden_width: usize,
    /// Contrastive embedding width (`moco_dim`).
    pub out_width: usize,
}

/// Two-layer MLP head mapping backbone features to the contrastive space.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionHead {
    fc1: Linear,
    bn: BatchNorm1d,
    fc2: Linear,
}

/// Activations retained by [`ProjectionHead::forward_train`].
#[derive(Debug, Clone)]
pub struct ProjectionCache {
    input: Array2<f32>,
    bn: BatchNormCache,
    pre_activation: Array2<f32>,
    hidden: Array2<f32>,
}

impl ProjectionHead {
    /// Randomly initialised head.
    pub fn new<R: Rng + ?Sized>(config: ProjectionConfig, rng: &mut R) -> NnResult<Self> {
        if config.in_width == 0 || config.hidden_width == 0 || config.out_width == 0 {
            return Err(NnError::invalid_config("ProjectionConfig", "all widths must be > 0"));
        }
        Ok(ProjectionHead {
            fc1: Linear::new(config.in_width, config.hidden_width, rng),
            bn: BatchNorm1d::new(config.hidden_width),
            fc2: Linear::new(config.hidden_width, config.out_width, rng),
        })
    }

    /// Layer widths.
    pub fn config(&self) -> ProjectionConfig {
        ProjectionConfig {
            in_width: self.fc1.in_features(),
            hidden_width: self.fc1.out_features(),
            out_width: self.fc2.out_features(),
        }
    }

    /// Training-mode forward pass; updates batch-norm running statistics.
    pub fn forward_train(&mut self, x: ArrayView2<'_, f32>) -> NnResult<(Array2<f32>, ProjectionCache)> {
        let h = self.fc1.forward(x)?;
        let (pre_activation, bn) = self.bn.forward_train(h.view())?;
        let hidden = pre_activation.mapv(relu);
        let out = self.fc2.forward(hidden.view())?;
        Ok((
            out,
            ProjectionCache { input: x.to_owned(), bn, pre_activation, hidden },
        ))
    }

    /// Inference forward pass using running statistics.
    pub fn forward_eval(&self, x: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        let h = self.fc1.forward(x)?;
        let hidden = self.bn.forward_eval(h.view()).mapv(relu);
        self.fc2.forward(hidden.view())
    }

    /// Parameter gradients for upstream gradient `grad_out` (`[N, d]`), in
    /// [`Parameterized::parameters`] order. The input gradient is not
    /// returned: the backbone below the head is frozen.
    pub fn backward(&self, cache: &ProjectionCache, grad_out: ArrayView2<'_, f32>) -> NnResult<Gradients> {
        let g2 = self.fc2.backward(cache.hidden.view(), grad_out)?;
        let mask = cache.pre_activation.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let d_pre = &g2.input * &mask;
        let (d_h, d_gamma, d_beta) = self.bn.backward(&cache.bn, d_pre.view());
        let g1 = self.fc1.backward(cache.input.view(), d_h.view())?;

        let mut grads = prefixed("fc1", g1.into_named());
        grads.extend(prefixed(
            "bn",
            vec![
                ("weight".to_string(), d_gamma.into_dyn()),
                ("bias".to_string(), d_beta.into_dyn()),
            ],
        ));
        grads.extend(prefixed("fc2", g2.into_named()));
        Ok(grads)
    }
}

impl Parameterized for ProjectionHead {
    fn parameters(&self) -> Vec<NamedView<'_>> {
        let mut p = prefixed("fc1", self.fc1.parameters());
        p.extend(prefixed("bn", self.bn.parameters()));
        p.extend(prefixed("fc2", self.fc2.parameters()));
        p
    }

    fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        let mut p = prefixed("fc1", self.fc1.parameters_mut());
        p.extend(prefixed("bn", self.bn.parameters_mut()));
        p.extend(prefixed("fc2", self.fc2.parameters_mut()));
        p
    }

    fn buffers(&self) -> Vec<NamedView<'_>> {
        prefixed("bn", self.bn.buffers())
    }

    fn buffers_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        prefixed("bn", self.bn.buffers_mut())
    }
}

/// ReLU that propagates NaN.
fn relu(v: f32) -> f32 {
    if v < 0.0 {
        0.0
    } else {
        v
    }
}

/// Row-wise L2 normalisation. Returns the normalised rows and the norms
/// (clamped away from zero, NaN kept) needed by [`l2_normalize_backward`].
pub fn l2_normalize_rows(x: ArrayView2<'_, f32>) -> (Array2<f32>, Array1<f32>) {
    let norms = x
        .map_axis(Axis(1), |row| row.dot(&row).sqrt())
        .mapv(|n| if n < 1e-12 { 1e-12 } else { n });
    let normalized = &x / &norms.view().insert_axis(Axis(1));
    (normalized, norms)
}

/// Gradient of row-wise L2 normalisation:
/// `∂L/∂x = (g − x̂ (x̂·g)) / ‖x‖`.
pub fn l2_normalize_backward(
    normalized: ArrayView2<'_, f32>,
    norms: &Array1<f32>,
    grad_out: ArrayView2<'_, f32>,
) -> Array2<f32> {
    let dots = (&normalized * &grad_out).sum_axis(Axis(1)).insert_axis(Axis(1));
    (&grad_out - &(&normalized * &dots)) / &norms.view().insert_axis(Axis(1))
}
