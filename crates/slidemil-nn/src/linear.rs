//! Fully-connected layer with explicit forward and backward passes.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::error::{NnError, NnResult};
use crate::params::{Gradients, NamedView, NamedViewMut, Parameterized};

/// `y = x Wᵀ + b` over a batch of row vectors.
///
/// `weight` has shape `[out_features, in_features]`, matching the usual
/// `(out, in)` layout so that checkpoints read naturally.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

/// Gradients of a [`Linear`] layer for one backward pass.
#[derive(Debug, Clone)]
pub struct LinearGrads {
    /// `∂L/∂x`, shape `[batch, in_features]`.
    pub input: Array2<f32>,
    /// `∂L/∂W`, shape `[out_features, in_features]`.
    pub weight: Array2<f32>,
    /// `∂L/∂b`, shape `[out_features]`.
    pub bias: Array1<f32>,
}

impl LinearGrads {
    /// Parameter gradients in [`Parameterized`] order.
    pub fn into_named(self) -> Gradients {
        vec![
            ("weight".to_string(), self.weight.into_dyn()),
            ("bias".to_string(), self.bias.into_dyn()),
        ]
    }
}

impl Linear {
    /// Xavier/Glorot-uniform weights, zero bias.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (in_features + out_features).max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        let weight = Array2::from_shape_fn((out_features, in_features), |_| dist.sample(rng));
        Linear { weight, bias: Array1::zeros(out_features) }
    }

    /// All-zero layer.
    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Linear {
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    /// Build a layer from explicit tensors.
    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> NnResult<Self> {
        if weight.nrows() != bias.len() {
            return Err(NnError::shape(
                "Linear::from_parts",
                vec![weight.nrows()],
                vec![bias.len()],
            ));
        }
        Ok(Linear { weight, bias })
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Weight matrix `[out, in]`.
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Bias vector `[out]`.
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Batched forward pass over rows of `x`.
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(NnError::shape(
                "Linear::forward",
                vec![x.nrows(), self.in_features()],
                x.shape().to_vec(),
            ));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }

    /// Forward pass for a single row vector.
    pub fn forward_one(&self, x: ArrayView1<'_, f32>) -> NnResult<Array1<f32>> {
        if x.len() != self.in_features() {
            return Err(NnError::shape(
                "Linear::forward_one",
                vec![self.in_features()],
                vec![x.len()],
            ));
        }
        Ok(self.weight.dot(&x) + &self.bias)
    }

    /// Backward pass given the forward input `x` and upstream gradient
    /// `grad_out` (`[batch, out_features]`).
    pub fn backward(
        &self,
        x: ArrayView2<'_, f32>,
        grad_out: ArrayView2<'_, f32>,
    ) -> NnResult<LinearGrads> {
        if grad_out.ncols() != self.out_features() || grad_out.nrows() != x.nrows() {
            return Err(NnError::shape(
                "Linear::backward",
                vec![x.nrows(), self.out_features()],
                grad_out.shape().to_vec(),
            ));
        }
        Ok(LinearGrads {
            input: grad_out.dot(&self.weight),
            weight: grad_out.t().dot(&x),
            bias: grad_out.sum_axis(Axis(0)),
        })
    }
}

impl Parameterized for Linear {
    fn parameters(&self) -> Vec<NamedView<'_>> {
        vec![
            ("weight".to_string(), self.weight.view().into_dyn()),
            ("bias".to_string(), self.bias.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        vec![
            ("weight".to_string(), self.weight.view_mut().into_dyn()),
            ("bias".to_string(), self.bias.view_mut().into_dyn()),
        ]
    }
}
