//! Contrastive (InfoNCE) loss over a query batch, its positive keys and the
//! negative key dictionary.
//!
//! For query `i` the logits are
//!
//! ```text
//! [ q_i·k_i , q_i·n_1 , … , q_i·n_M ] / τ
//! ```
//!
//! and the loss is the cross-entropy with target class 0, averaged over the
//! batch. Log-sum-exp is evaluated with the row maximum subtracted.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::LossError;

/// Loss value and its gradient with respect to the (normalised) queries.
#[derive(Debug, Clone)]
pub struct ContrastiveLoss {
    /// Mean cross-entropy over the batch.
    pub loss: f32,
    /// `∂loss/∂q`, shape `[N, d]`.
    pub grad_queries: Array2<f32>,
    /// Fraction of queries whose positive logit is the largest.
    pub top1_accuracy: f32,
}

/// Compute the loss and its query gradient.
///
/// `queries` and `positives` are `[N, d]` and index-aligned; `negatives` is
/// `[M, d]` and may be empty. All rows are expected to be unit-normalised.
pub fn contrastive_loss(
    queries: ArrayView2<'_, f32>,
    positives: ArrayView2<'_, f32>,
    negatives: ArrayView2<'_, f32>,
    temperature: f32,
) -> Result<ContrastiveLoss, LossError> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(LossError::InvalidTemperature(temperature));
    }
    let (n, d) = queries.dim();
    if positives.dim() != (n, d) {
        return Err(LossError::ShapeMismatch {
            context: "positives",
            expected: vec![n, d],
            actual: positives.shape().to_vec(),
        });
    }
    if negatives.ncols() != d {
        return Err(LossError::ShapeMismatch {
            context: "negatives",
            expected: vec![negatives.nrows(), d],
            actual: negatives.shape().to_vec(),
        });
    }
    if n == 0 {
        return Ok(ContrastiveLoss { loss: 0.0, grad_queries: Array2::zeros((0, d)), top1_accuracy: 0.0 });
    }

    let inv_t = 1.0 / temperature;
    let pos: Array1<f32> = (&queries * &positives).sum_axis(Axis(1)) * inv_t;
    let neg: Array2<f32> = queries.dot(&negatives.t()) * inv_t;

    let mut total = 0.0f32;
    let mut correct = 0usize;
    // Softmax probabilities, column 0 = positive.
    let mut p_pos = Array1::<f32>::zeros(n);
    let mut p_neg = Array2::<f32>::zeros(neg.raw_dim());
    for i in 0..n {
        let row = neg.row(i);
        let max = row.iter().copied().fold(pos[i], f32::max);
        let e_pos = (pos[i] - max).exp();
        let mut sum = e_pos;
        for (j, &l) in row.iter().enumerate() {
            let e = (l - max).exp();
            p_neg[[i, j]] = e;
            sum += e;
        }
        total += sum.ln() + max - pos[i];
        p_pos[i] = e_pos / sum;
        p_neg.row_mut(i).mapv_inplace(|e| e / sum);
        if row.iter().all(|&l| pos[i] >= l) {
            correct += 1;
        }
    }
    let loss = total / n as f32;

    // ∂/∂q_i = (1/(Nτ)) [ (p_pos − 1) k_i + Σ_j p_neg_ij n_j ]
    let scale = inv_t / n as f32;
    let coeff_pos = (&p_pos - 1.0).insert_axis(Axis(1));
    let grad_queries = (&positives * &coeff_pos + p_neg.dot(&negatives)) * scale;

    if !loss.is_finite() || grad_queries.iter().any(|g| !g.is_finite()) {
        return Err(LossError::NonFinite { value: loss, step: 0 });
    }
    Ok(ContrastiveLoss { loss, grad_queries, top1_accuracy: correct as f32 / n as f32 })
}
