//! Benchmarks for attention-MIL aggregation and the projection head.
//!
//! Inputs are built from deterministic ramps; model weights come from a
//! fixed seed so that numbers are comparable across runs.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p slidemil-nn
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use slidemil_nn::{
    AggregatorConfig, AttentionAggregator, BackboneKind, PoolingMode, ProjectionConfig,
    ProjectionHead,
};

fn bag(n: usize, width: usize) -> Array2<f32> {
    Array2::from_shape_fn((n, width), |(i, j)| ((i * 31 + j * 7) % 97) as f32 * 0.01 - 0.48)
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregator
// ─────────────────────────────────────────────────────────────────────────────

/// Forward pass cost as the bag grows, for both channel collapse modes.
fn bench_aggregator_bag_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator_bag_scaling");
    let spec = BackboneKind::Resnet34.resolve(128, 4, true);

    for pooling in [PoolingMode::SingleChannel, PoolingMode::MultiChannelAttention] {
        let config = AggregatorConfig::from_spec(spec, true, 0.0, pooling);
        let model = AttentionAggregator::new(config, &mut StdRng::seed_from_u64(33))
            .expect("valid aggregator config");
        for n in [64_usize, 512, 2048] {
            let features = bag(n, spec.feature_width);
            group.bench_with_input(
                BenchmarkId::new(format!("{pooling:?}"), n),
                &features,
                |b, f| b.iter(|| model.forward(black_box(f.view())).expect("forward")),
            );
        }
    }
    group.finish();
}

/// Parallel inference over a batch of slides.
fn bench_aggregator_forward_batch(c: &mut Criterion) {
    let spec = BackboneKind::Resnet34.resolve(128, 4, true);
    let config = AggregatorConfig::from_spec(spec, true, 0.0, PoolingMode::SingleChannel);
    let model = AttentionAggregator::new(config, &mut StdRng::seed_from_u64(33))
        .expect("valid aggregator config");
    let bags: Vec<Array2<f32>> = (0..16).map(|i| bag(100 + i * 20, 512)).collect();
    let views: Vec<_> = bags.iter().map(|b| b.view()).collect();

    c.bench_function("aggregator_forward_batch_16", |b| {
        b.iter(|| model.forward_batch(black_box(&views)).expect("forward_batch"))
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Projection head
// ─────────────────────────────────────────────────────────────────────────────

fn bench_projection_train_step(c: &mut Criterion) {
    let config = ProjectionConfig { in_width: 512, hidden_width: 512, out_width: 128 };
    let mut head = ProjectionHead::new(config, &mut StdRng::seed_from_u64(33)).expect("head");
    let x = bag(64, 512);
    let grad = Array2::from_elem((64, 128), 0.01f32);

    c.bench_function("projection_forward_backward_b64", |b| {
        b.iter(|| {
            let (_, cache) = head.forward_train(black_box(x.view())).expect("forward");
            head.backward(&cache, grad.view()).expect("backward")
        })
    });
}

criterion_group!(
    benches,
    bench_aggregator_bag_scaling,
    bench_aggregator_forward_batch,
    bench_projection_train_step
);
criterion_main!(benches);
