//! Benchmarks for the contrastive training step.
//!
//! Inputs are fixed ramps or seeded generators so numbers are reproducible.
//!
//! ```bash
//! cargo bench -p slidemil-train
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use slidemil_nn::projection::l2_normalize_rows;
use slidemil_nn::{ProjectionConfig, ProjectionHead};
use slidemil_train::losses::contrastive_loss;
use slidemil_train::momentum::{sync, BatchShuffle};
use slidemil_train::queue::KeyDictionary;

fn unit_matrix(rows: usize, dim: usize, phase: f32) -> Array2<f32> {
    let raw = Array2::from_shape_fn((rows, dim), |(i, j)| ((i * dim + j) as f32 * 0.37 + phase).sin());
    l2_normalize_rows(raw.view()).0
}

// ─────────────────────────────────────────────────────────────────────────────
// Loss
// ─────────────────────────────────────────────────────────────────────────────

fn bench_contrastive_loss(c: &mut Criterion) {
    let mut group = c.benchmark_group("contrastive_loss");
    let q = unit_matrix(64, 128, 0.0);
    let k = unit_matrix(64, 128, 0.1);
    for &keys in &[1024usize, 4096] {
        let negatives = unit_matrix(keys, 128, 1.3);
        group.bench_with_input(BenchmarkId::new("batch64_dim128", keys), &keys, |b, _| {
            b.iter(|| contrastive_loss(black_box(q.view()), black_box(k.view()), negatives.view(), 0.07))
        });
    }
    group.finish();
}

// ─────────────────────────────────────────────────────────────────────────────
// Dictionary, shuffle, EMA
// ─────────────────────────────────────────────────────────────────────────────

fn bench_dictionary_update(c: &mut Criterion) {
    let batch = unit_matrix(64, 128, 0.5);
    let mut dict = KeyDictionary::new(4096, 128);
    for _ in 0..64 {
        let _ = dict.update(batch.view());
    }
    c.bench_function("dictionary_update_full_4096", |b| {
        b.iter(|| {
            let _ = dict.update(black_box(batch.view()));
        })
    });
}

fn bench_shuffle_round_trip(c: &mut Criterion) {
    let batch = unit_matrix(64, 128, 0.2);
    let mut rng = StdRng::seed_from_u64(33);
    c.bench_function("shuffle_restore_batch64", |b| {
        b.iter(|| {
            let shuffle = BatchShuffle::random(64, &mut rng);
            let shuffled = shuffle.apply(batch.view()).ok();
            shuffled.and_then(|s| shuffle.restore(s.view()).ok())
        })
    });
}

fn bench_momentum_sync(c: &mut Criterion) {
    let config = ProjectionConfig { in_width: 512, hidden_width: 512, out_width: 128 };
    let online = ProjectionHead::new(config, &mut StdRng::seed_from_u64(1)).ok();
    let momentum = ProjectionHead::new(config, &mut StdRng::seed_from_u64(2)).ok();
    if let (Some(online), Some(mut momentum)) = (online, momentum) {
        c.bench_function("ema_sync_projection_512_512_128", |b| {
            b.iter(|| sync(&online, &mut momentum, black_box(0.999)))
        });
    }
}

criterion_group!(
    benches,
    bench_contrastive_loss,
    bench_dictionary_update,
    bench_shuffle_round_trip,
    bench_momentum_sync
);
criterion_main!(benches);
