//! Integration tests for the contrastive core: EMA sync, key dictionary,
//! batch shuffle and the loss.
//!
//! All fixtures are fixed arrays or seeded generators.

use approx::assert_abs_diff_eq;
use ndarray::{array, s, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use slidemil_nn::{Parameterized, ProjectionConfig, ProjectionHead};
use slidemil_train::error::{LossError, TrainError};
use slidemil_train::losses::contrastive_loss;
use slidemil_train::momentum::{sync, BatchShuffle, EncoderPair, MomentumEncoder};
use slidemil_train::queue::KeyDictionary;

fn head(seed: u64) -> ProjectionHead {
    ProjectionHead::new(
        ProjectionConfig { in_width: 8, hidden_width: 6, out_width: 4 },
        &mut StdRng::seed_from_u64(seed),
    )
    .unwrap()
}

fn rows(n: usize, d: usize, offset: f32) -> Array2<f32> {
    Array2::from_shape_fn((n, d), |(i, j)| offset + (i * d + j) as f32)
}

// ---------------------------------------------------------------------------
// Momentum sync
// ---------------------------------------------------------------------------

#[test]
fn zero_momentum_sync_is_bit_identical() {
    let online = head(10);
    let mut momentum = head(11);
    sync(&online, &mut momentum, 0.0).unwrap();
    let a = online.parameters();
    let b = momentum.parameters();
    assert_eq!(a.len(), b.len());
    for ((na, va), (nb, vb)) in a.iter().zip(b.iter()) {
        assert_eq!(na, nb);
        assert_eq!(va, vb, "{na} differs after m = 0 sync");
    }
}

#[test]
fn ema_sync_matches_formula_elementwise() {
    let online = head(1);
    let mut momentum = head(2);
    let old: Vec<_> = momentum.parameters().into_iter().map(|(n, v)| (n, v.to_owned())).collect();
    let m = 0.75f32;
    sync(&online, &mut momentum, m).unwrap();

    for (((_, new), (_, prev)), (_, src)) in momentum
        .parameters()
        .iter()
        .zip(old.iter())
        .zip(online.parameters().iter())
    {
        for ((&n, &p), &s) in new.iter().zip(prev.iter()).zip(src.iter()) {
            assert_abs_diff_eq!(n, m * p + (1.0 - m) * s, epsilon = 1e-6);
        }
    }
}

#[test]
fn momentum_encoder_is_never_touched_by_the_online_update() {
    let online = head(4);
    let momentum = MomentumEncoder::new(&online).unwrap();
    let snapshot = momentum.get().clone();

    let mut changed = online.clone();
    for (_, mut p) in changed.parameters_mut() {
        p.mapv_inplace(|v| v + 1.0);
    }
    assert_eq!(momentum.get(), &snapshot);
}

#[test]
fn encoder_pair_rejects_width_mismatch() {
    let backbone = std::sync::Arc::new(slidemil_nn::RandomProjectionBackbone::new(3, 2, 5, 0).unwrap());
    assert!(EncoderPair::new(backbone, head(0)).is_err());
}

// ---------------------------------------------------------------------------
// Key dictionary
// ---------------------------------------------------------------------------

#[test]
fn dictionary_never_exceeds_capacity_and_evicts_oldest() {
    let mut dict = KeyDictionary::new(5, 2);
    dict.update(rows(3, 2, 0.0).view()).unwrap();
    assert_eq!(dict.len(), 3);
    let before = dict.keys().to_owned();

    let incoming = rows(3, 2, 100.0);
    dict.update(incoming.view()).unwrap();
    assert_eq!(dict.len(), 5);
    assert!(dict.len() <= dict.capacity());

    // Newest first, then the surviving older rows; the oldest one is gone.
    assert_eq!(dict.keys().slice(s![..3, ..]), incoming);
    assert_eq!(dict.keys().slice(s![3.., ..]), before.slice(s![..2, ..]));
    let oldest = before.row(2);
    assert!(dict.keys().axis_iter(Axis(0)).all(|r| r != oldest));
}

#[test]
fn dictionary_update_rejects_wrong_width() {
    let mut dict = KeyDictionary::new(4, 3);
    let err = dict.update(rows(2, 2, 0.0).view()).unwrap_err();
    assert!(matches!(err, TrainError::Loss(LossError::ShapeMismatch { .. })));
    assert!(dict.is_empty());
}

#[test]
fn initialize_stops_when_capacity_is_reached() {
    let mut calls = 0;
    let dict = KeyDictionary::initialize(6, 2, || {
        calls += 1;
        Ok(Some(rows(4, 2, calls as f32)))
    })
    .unwrap();
    assert_eq!(calls, 2);
    assert_eq!(dict.len(), 6);
    assert!(dict.is_full());
}

#[test]
fn short_initialisation_is_a_warm_up_state() {
    let mut batches = vec![rows(2, 2, 0.0)].into_iter();
    let dict = KeyDictionary::initialize(10, 2, || Ok(batches.next())).unwrap();
    assert_eq!(dict.len(), 2);
    assert!(!dict.is_full());
}

// ---------------------------------------------------------------------------
// Batch shuffle
// ---------------------------------------------------------------------------

#[test]
fn shuffle_round_trip_reproduces_batch_exactly() {
    let batch = rows(9, 3, 0.5);
    let mut rng = StdRng::seed_from_u64(33);
    for _ in 0..20 {
        let shuffle = BatchShuffle::random(9, &mut rng);
        let restored = shuffle.restore(shuffle.apply(batch.view()).unwrap().view()).unwrap();
        assert_eq!(restored, batch);
    }
}

#[test]
fn slice_shuffle_agrees_with_row_shuffle() {
    let batch = rows(4, 2, 0.0);
    let shuffle = BatchShuffle::from_permutation(vec![3, 1, 0, 2]).unwrap();
    let labels = shuffle.apply_slice(&[0usize, 1, 2, 3]).unwrap();
    let shuffled = shuffle.apply(batch.view()).unwrap();
    for (a, &src) in labels.iter().enumerate() {
        assert_eq!(shuffled.row(a), batch.row(src));
    }
}

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

#[test]
fn loss_vanishes_for_matched_keys_and_opposite_negatives() {
    let q = array![[0.0f32, 1.0], [0.0, 1.0], [0.0, 1.0]];
    let negatives = array![[0.0f32, -1.0], [0.0, -1.0]];
    let out = contrastive_loss(q.view(), q.view(), negatives.view(), 0.07).unwrap();
    assert!(out.loss < 1e-6);
    assert_eq!(out.top1_accuracy, 1.0);
}

#[test]
fn loss_grows_as_negatives_approach_the_query() {
    let q = array![[1.0f32, 0.0]];
    let far = array![[-1.0f32, 0.0]];
    let near = array![[0.6f32, 0.8]];
    let a = contrastive_loss(q.view(), q.view(), far.view(), 0.2).unwrap().loss;
    let b = contrastive_loss(q.view(), q.view(), near.view(), 0.2).unwrap().loss;
    assert!(b > a);
}
