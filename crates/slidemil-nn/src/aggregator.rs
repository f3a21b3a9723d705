//! Attention-based multiple-instance pooling.
//!
//! Turns the unordered set of patch embeddings of one slide into a slide
//! embedding, per-class logits and one attention distribution over patches
//! per class.
//!
//! ```text
//! bag [N, F] ─► (embedding: F→E) ─► h [N, E]
//!                                     │
//!          attention: E→D, tanh, D→K  ▼
//!                               scores [N, K] ─► softmax over N ─► A [K, N]
//!                                                                   │
//!                                         M = A · h  [K, E] ◄───────┘
//!                                                │
//!              collapse (linear over K·E, or attention over K rows)
//!                                                ▼
//!                                   slide embedding [E] ─► ReLU ─► dropout ─► classifier ─► logits [K]
//! ```
//!
//! Every patch goes through the same map and pooling is a softmax-weighted
//! sum, so permuting the bag permutes the columns of `A` and leaves the
//! logits unchanged. Column `i` of `A` always refers to row `i` of the input.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, RngCore};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backbone::BackboneSpec;
use crate::error::{NnError, NnResult};
use crate::linear::Linear;
use crate::params::{prefixed, NamedView, NamedViewMut, Parameterized};

/// How the `K` per-class slide embeddings are collapsed into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    /// Concatenate the `K` channel embeddings and map `K·E → E` linearly.
    SingleChannel,
    /// Second attention step over the `K` channel embeddings (`E → D → 1`).
    MultiChannelAttention,
}

/// Shape and regularisation of an [`AttentionAggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Width of incoming patch features.
    pub feature_width: usize,
    /// Width `E` of the embeddings attention pools over.
    pub embedding_width: usize,
    /// Width `D` of the attention hidden layer.
    pub hidden_width: usize,
    /// Number of classes `K`.
    pub class_count: usize,
    /// Dropout probability before the classifier.
    pub dropout: f32,
    /// Re-embed features with a learned `F → E` map before attention.
    pub embedding: bool,
    /// Channel collapse policy.
    pub pooling: PoolingMode,
}

impl AggregatorConfig {
    /// Build from a resolved backbone capability record.
    pub fn from_spec(spec: BackboneSpec, embedding: bool, dropout: f32, pooling: PoolingMode) -> Self {
        AggregatorConfig {
            feature_width: spec.feature_width,
            embedding_width: if embedding { spec.embedding_width } else { spec.feature_width },
            hidden_width: spec.hidden_width,
            class_count: spec.class_count,
            dropout,
            embedding,
            pooling,
        }
    }

    /// Check widths and dropout range.
    pub fn validate(&self) -> NnResult<()> {
        if self.feature_width == 0 || self.embedding_width == 0 || self.hidden_width == 0 {
            return Err(NnError::invalid_config("AggregatorConfig", "widths must be > 0"));
        }
        if self.class_count == 0 {
            return Err(NnError::invalid_config("class_count", "must be >= 1"));
        }
        if !self.embedding && self.embedding_width != self.feature_width {
            return Err(NnError::invalid_config(
                "embedding_width",
                "must equal feature_width when embedding is disabled",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(NnError::invalid_config("dropout", "must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Two-layer attention scorer `E → D → out` with `tanh` in between.
#[derive(Debug, Clone, PartialEq)]
struct AttentionScorer {
    hidden: Linear,
    score: Linear,
}

impl AttentionScorer {
    fn new<R: Rng + ?Sized>(input: usize, hidden: usize, out: usize, rng: &mut R) -> Self {
        AttentionScorer {
            hidden: Linear::new(input, hidden, rng),
            score: Linear::new(hidden, out, rng),
        }
    }

    /// Raw scores `[rows, out]`.
    fn scores(&self, x: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        let h = self.hidden.forward(x)?.mapv(f32::tanh);
        self.score.forward(h.view())
    }

    fn parameters(&self) -> Vec<NamedView<'_>> {
        let mut p = prefixed("hidden", self.hidden.parameters());
        p.extend(prefixed("score", self.score.parameters()));
        p
    }

    fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        let mut p = prefixed("hidden", self.hidden.parameters_mut());
        p.extend(prefixed("score", self.score.parameters_mut()));
        p
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ChannelCollapse {
    Linear(Linear),
    Attention(AttentionScorer),
}

/// Result of one aggregation pass over a slide bag.
#[derive(Debug, Clone)]
pub struct AggregatorOutput {
    /// Per-class slide scores, shape `[K]`.
    pub logits: Array1<f32>,
    /// Attention weights `[K, N]`; each row sums to 1.
    pub attention: Array2<f32>,
    /// Per-class pooled embeddings `[K, E]`.
    pub channel_embeddings: Array2<f32>,
    /// Collapsed slide embedding `[E]`, before the activation.
    pub slide_embedding: Array1<f32>,
    /// Weights over the `K` channel embeddings in multi-channel mode.
    pub channel_attention: Option<Array1<f32>>,
}

impl AggregatorOutput {
    /// Index of the largest logit.
    pub fn predicted_class(&self) -> usize {
        argmax(self.logits.view())
    }

    /// Softmax over the logits.
    pub fn probabilities(&self) -> Array1<f32> {
        let mut p = self.logits.clone();
        softmax_in_place(p.as_slice_mut().unwrap_or(&mut []));
        p
    }

    /// Attention distribution of class `class` over patches.
    pub fn attention_for(&self, class: usize) -> NnResult<ArrayView1<'_, f32>> {
        if class >= self.attention.nrows() {
            return Err(NnError::invalid_config(
                "class",
                format!("{class} out of range for {} classes", self.attention.nrows()),
            ));
        }
        Ok(self.attention.row(class))
    }

    /// Number of patches in the aggregated bag.
    pub fn bag_size(&self) -> usize {
        self.attention.ncols()
    }
}

/// Attention-MIL aggregator. Stateless between calls apart from its
/// parameters, so independent slides can be processed concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionAggregator {
    config: AggregatorConfig,
    embedding: Option<Linear>,
    attention: AttentionScorer,
    collapse: ChannelCollapse,
    classifier: Linear,
}

impl AttentionAggregator {
    /// Randomly initialised aggregator.
    pub fn new<R: Rng + ?Sized>(config: AggregatorConfig, rng: &mut R) -> NnResult<Self> {
        config.validate()?;
        let e = config.embedding_width;
        let d = config.hidden_width;
        let k = config.class_count;

        let embedding = config
            .embedding
            .then(|| Linear::new(config.feature_width, e, rng));
        let attention = AttentionScorer::new(e, d, k, rng);
        let collapse = match config.pooling {
            PoolingMode::SingleChannel => ChannelCollapse::Linear(Linear::new(e * k, e, rng)),
            PoolingMode::MultiChannelAttention => {
                ChannelCollapse::Attention(AttentionScorer::new(e, d, 1, rng))
            }
        };
        let classifier = Linear::new(e, k, rng);

        Ok(AttentionAggregator { config, embedding, attention, collapse, classifier })
    }

    /// Configuration this aggregator was built with.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Inference pass (no dropout).
    pub fn forward(&self, bag: ArrayView2<'_, f32>) -> NnResult<AggregatorOutput> {
        self.forward_impl(bag, None)
    }

    /// Training pass with dropout drawn from `rng`.
    pub fn forward_train(&self, bag: ArrayView2<'_, f32>, rng: &mut dyn RngCore) -> NnResult<AggregatorOutput> {
        self.forward_impl(bag, Some(rng))
    }

    /// Inference over several slides in parallel. Returns `[B, K]` logits in
    /// input order.
    pub fn forward_batch(&self, bags: &[ArrayView2<'_, f32>]) -> NnResult<Array2<f32>> {
        let outputs: Vec<AggregatorOutput> = bags
            .par_iter()
            .map(|bag| self.forward(bag.view()))
            .collect::<NnResult<_>>()?;
        let mut logits = Array2::zeros((outputs.len(), self.config.class_count));
        for (mut row, out) in logits.axis_iter_mut(Axis(0)).zip(outputs.iter()) {
            row.assign(&out.logits);
        }
        Ok(logits)
    }

    /// Per-patch embeddings the attention pools over (`[N, E]`).
    pub fn embed(&self, bag: ArrayView2<'_, f32>) -> NnResult<Array2<f32>> {
        if bag.nrows() == 0 {
            return Err(NnError::EmptyBag);
        }
        if bag.ncols() != self.config.feature_width {
            return Err(NnError::shape(
                "AttentionAggregator::embed",
                vec![bag.nrows(), self.config.feature_width],
                bag.shape().to_vec(),
            ));
        }
        match &self.embedding {
            Some(layer) => layer.forward(bag),
            None => Ok(bag.to_owned()),
        }
    }

    fn forward_impl(
        &self,
        bag: ArrayView2<'_, f32>,
        rng: Option<&mut dyn RngCore>,
    ) -> NnResult<AggregatorOutput> {
        let h = self.embed(bag)?;

        // [N, K] -> [K, N], softmax along N independently per class.
        let mut attention = self.attention.scores(h.view())?.reversed_axes();
        softmax_rows(&mut attention);

        let channel_embeddings = attention.dot(&h);

        let (slide_embedding, channel_attention) = match &self.collapse {
            ChannelCollapse::Linear(layer) => {
                let len = channel_embeddings.len();
                let flat = Array2::from_shape_vec((1, len), channel_embeddings.iter().copied().collect())
                    .map_err(|_| {
                        NnError::shape("AttentionAggregator::collapse", vec![1, len], vec![len])
                    })?;
                (layer.forward(flat.view())?.row(0).to_owned(), None)
            }
            ChannelCollapse::Attention(scorer) => {
                let mut weights = scorer.scores(channel_embeddings.view())?.reversed_axes();
                softmax_rows(&mut weights);
                let pooled = weights.dot(&channel_embeddings);
                (pooled.row(0).to_owned(), Some(weights.row(0).to_owned()))
            }
        };

        let mut activated = slide_embedding.mapv(|v| v.max(0.0));
        if let Some(rng) = rng {
            apply_dropout(&mut activated, self.config.dropout, rng);
        }
        let logits = self.classifier.forward_one(activated.view())?;

        Ok(AggregatorOutput {
            logits,
            attention,
            channel_embeddings,
            slide_embedding,
            channel_attention,
        })
    }
}

impl Parameterized for AttentionAggregator {
    fn parameters(&self) -> Vec<NamedView<'_>> {
        let mut p = match &self.embedding {
            Some(layer) => prefixed("embedding", layer.parameters()),
            None => Vec::new(),
        };
        p.extend(prefixed("attention", self.attention.parameters()));
        match &self.collapse {
            ChannelCollapse::Linear(layer) => p.extend(prefixed("collapse", layer.parameters())),
            ChannelCollapse::Attention(scorer) => {
                p.extend(prefixed("channel_attention", scorer.parameters()))
            }
        }
        p.extend(prefixed("classifier", self.classifier.parameters()));
        p
    }

    fn parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        let mut p = match &mut self.embedding {
            Some(layer) => prefixed("embedding", layer.parameters_mut()),
            None => Vec::new(),
        };
        p.extend(prefixed("attention", self.attention.parameters_mut()));
        match &mut self.collapse {
            ChannelCollapse::Linear(layer) => p.extend(prefixed("collapse", layer.parameters_mut())),
            ChannelCollapse::Attention(scorer) => {
                p.extend(prefixed("channel_attention", scorer.parameters_mut()))
            }
        }
        p.extend(prefixed("classifier", self.classifier.parameters_mut()));
        p
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Numerically stable in-place softmax.
pub fn softmax_in_place(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

fn softmax_rows(m: &mut Array2<f32>) {
    for mut row in m.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}

fn apply_dropout(x: &mut Array1<f32>, p: f32, rng: &mut dyn RngCore) {
    if p <= 0.0 {
        return;
    }
    let scale = 1.0 / (1.0 - p);
    for v in x.iter_mut() {
        if rng.gen::<f32>() < p {
            *v = 0.0;
        } else {
            *v *= scale;
        }
    }
}

fn argmax(values: ArrayView1<'_, f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::BackboneKind;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(pooling: PoolingMode, embedding: bool) -> AggregatorConfig {
        AggregatorConfig {
            feature_width: 12,
            embedding_width: if embedding { 8 } else { 12 },
            hidden_width: 6,
            class_count: 3,
            dropout: 0.25,
            embedding,
            pooling,
        }
    }

    fn bag(n: usize) -> Array2<f32> {
        Array2::from_shape_fn((n, 12), |(i, j)| ((i * 7 + j * 3) % 11) as f32 * 0.1 - 0.5)
    }

    fn aggregator(pooling: PoolingMode, embedding: bool) -> AttentionAggregator {
        AttentionAggregator::new(config(pooling, embedding), &mut StdRng::seed_from_u64(5)).unwrap()
    }

    #[test]
    fn attention_rows_sum_to_one() {
        for pooling in [PoolingMode::SingleChannel, PoolingMode::MultiChannelAttention] {
            let out = aggregator(pooling, true).forward(bag(9).view()).unwrap();
            assert_eq!(out.attention.shape(), &[3, 9]);
            for row in out.attention.axis_iter(Axis(0)) {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
                assert!(row.iter().all(|&w| w >= 0.0));
            }
        }
    }

    #[test]
    fn single_patch_gets_full_weight() {
        let out = aggregator(PoolingMode::SingleChannel, false).forward(bag(1).view()).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(out.attention[[k, 0]], 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn output_is_permutation_invariant() {
        let agg = aggregator(PoolingMode::MultiChannelAttention, true);
        let original = bag(6);
        let perm = [4usize, 0, 5, 2, 1, 3];
        let shuffled = original.select(Axis(0), &perm);

        let a = agg.forward(original.view()).unwrap();
        let b = agg.forward(shuffled.view()).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(a.logits[k], b.logits[k], epsilon = 1e-5);
            // Weights follow their patch, not their position.
            for (new_pos, &old_pos) in perm.iter().enumerate() {
                assert_abs_diff_eq!(a.attention[[k, old_pos]], b.attention[[k, new_pos]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn multi_channel_reports_channel_weights() {
        let out = aggregator(PoolingMode::MultiChannelAttention, true).forward(bag(4).view()).unwrap();
        let weights = out.channel_attention.expect("multi-channel mode");
        assert_eq!(weights.len(), 3);
        assert_abs_diff_eq!(weights.sum(), 1.0, epsilon = 1e-5);
        assert_eq!(out.slide_embedding.len(), 8);
    }

    #[test]
    fn empty_bag_is_rejected() {
        let agg = aggregator(PoolingMode::SingleChannel, true);
        let err = agg.forward(Array2::<f32>::zeros((0, 12)).view()).unwrap_err();
        assert!(matches!(err, NnError::EmptyBag));
    }

    #[test]
    fn wrong_feature_width_is_rejected() {
        let agg = aggregator(PoolingMode::SingleChannel, true);
        assert!(agg.forward(Array2::<f32>::zeros((3, 5)).view()).is_err());
    }

    #[test]
    fn eval_is_deterministic_and_train_uses_dropout() {
        let agg = aggregator(PoolingMode::SingleChannel, true);
        let b = bag(5);
        let e1 = agg.forward(b.view()).unwrap();
        let e2 = agg.forward(b.view()).unwrap();
        assert_eq!(e1.logits, e2.logits);

        let mut rng = StdRng::seed_from_u64(99);
        let differs = (0..20).any(|_| {
            let t = agg.forward_train(b.view(), &mut rng).unwrap();
            t.logits != e1.logits
        });
        assert!(differs, "dropout never changed the logits");
    }

    #[test]
    fn batch_forward_stacks_logits_in_order() {
        let agg = aggregator(PoolingMode::MultiChannelAttention, false);
        let b1 = bag(3);
        let b2 = bag(7);
        let logits = agg.forward_batch(&[b1.view(), b2.view()]).unwrap();
        assert_eq!(logits.shape(), &[2, 3]);
        assert_eq!(logits.row(1), agg.forward(b2.view()).unwrap().logits);
    }

    #[test]
    fn parameter_names_depend_on_pooling_mode() {
        let single = aggregator(PoolingMode::SingleChannel, true);
        let multi = aggregator(PoolingMode::MultiChannelAttention, false);
        let names = |a: &AttentionAggregator| -> Vec<String> {
            a.parameters().into_iter().map(|(n, _)| n).collect()
        };
        assert!(names(&single).contains(&"collapse.weight".to_string()));
        assert!(names(&single).contains(&"embedding.weight".to_string()));
        assert!(names(&multi).contains(&"channel_attention.score.weight".to_string()));
        assert!(!names(&multi).iter().any(|n| n.starts_with("embedding")));
    }

    #[test]
    fn from_spec_respects_embedding_flag() {
        let spec = BackboneKind::Resnet34.resolve(128, 2, false);
        let cfg = AggregatorConfig::from_spec(spec, false, 0.1, PoolingMode::SingleChannel);
        assert_eq!(cfg.embedding_width, 512);
        cfg.validate().unwrap();
    }

    #[test]
    fn softmax_is_stable_for_large_inputs() {
        let mut v = [1000.0f32, 1000.0, 999.0];
        softmax_in_place(&mut v);
        assert!(v.iter().all(|x| x.is_finite()));
        assert_abs_diff_eq!(v.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }
}
