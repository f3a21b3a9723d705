//! End-to-end pretraining on synthetic patches.

use slidemil_nn::{BackboneKind, FeatureExtractor, LoadMode, ParamStore, ProjectionHead, RandomProjectionBackbone};
use slidemil_train::checkpoint::BEST_FILE;
use slidemil_train::config::{ContrastiveConfig, DatasetConfig, ModelConfig, NonFinitePolicy, PretrainConfig, RunContext};
use slidemil_train::dataset::SyntheticPatchSource;
use slidemil_train::trainer::ContrastiveTrainer;
use slidemil_train::TrainError;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn tiny_config(output_dir: &Path) -> PretrainConfig {
    PretrainConfig {
        experiment_name: "tiny".into(),
        output_dir: output_dir.to_path_buf(),
        run: RunContext { seed: 33, num_threads: 2 },
        model: ModelConfig {
            backbone: BackboneKind::RandomProjection { width: 12 },
            ..ModelConfig::default()
        },
        dataset: DatasetConfig { patch_size: 16, input_size: 12, ..DatasetConfig::default() },
        training: ContrastiveConfig {
            epochs: 3,
            batch_size: 4,
            num_keys: 8,
            moco_dim: 4,
            projection_hidden: 8,
            learning_rate: 0.05,
            checkpoint_interval: 2,
            early_stop_patience: 5,
            non_finite: NonFinitePolicy::Abort,
            ..ContrastiveConfig::default()
        },
        ..PretrainConfig::default()
    }
}

fn backbone(config: &PretrainConfig) -> Arc<dyn FeatureExtractor> {
    Arc::new(config.model.backbone.stand_in_extractor(config.run.seed).unwrap())
}

#[test]
fn synthetic_run_writes_checkpoints_and_config_copy() {
    let tmp = tempdir().unwrap();
    let config = tiny_config(tmp.path());
    let source = SyntheticPatchSource::new(18, 16, 5);

    let mut trainer = ContrastiveTrainer::new(config.clone(), backbone(&config)).unwrap();
    let summary = trainer.run(&source).unwrap();

    // 18 patches in batches of 4 keep 4 full steps per epoch.
    assert!(!summary.history.is_empty());
    for stats in &summary.history {
        assert_eq!(stats.steps + stats.skipped_steps, 4);
        assert!(stats.mean_loss.is_finite());
        assert_eq!(stats.dictionary_len, 8);
    }
    if !summary.stopped_early {
        assert_eq!(summary.history.len(), 3);
    }
    assert!(summary.best_loss.is_finite());
    assert_eq!(trainer.global_step(), summary.history.iter().map(|s| s.steps).sum::<usize>());

    let ckpt_dir = tmp.path().join("20x").join("random_projection");
    assert!(ckpt_dir.join(BEST_FILE).exists());
    assert!(tmp.path().join("config_tiny.json").exists());

    let reloaded = PretrainConfig::from_json(&tmp.path().join("config_tiny.json")).unwrap();
    assert_eq!(reloaded, config);

    let mut restored = ProjectionHead::new(
        trainer.encoders().online().config(),
        &mut config.run.stream(99),
    )
    .unwrap();
    let report = ParamStore::load(&ckpt_dir.join(BEST_FILE))
        .unwrap()
        .load_into(&mut restored, LoadMode::Strict)
        .unwrap();
    assert!(report.is_exact());
}

#[test]
fn runs_are_reproducible_for_a_fixed_seed() {
    let source = SyntheticPatchSource::new(12, 16, 8);
    let losses = |dir: &Path| {
        let config = tiny_config(dir);
        let mut trainer = ContrastiveTrainer::new(config.clone(), backbone(&config)).unwrap();
        trainer.run(&source).unwrap().history.iter().map(|s| s.mean_loss).collect::<Vec<_>>()
    };
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    assert_eq!(losses(a.path()), losses(b.path()));
}

#[test]
fn pool_smaller_than_one_batch_is_rejected() {
    let tmp = tempdir().unwrap();
    let config = tiny_config(tmp.path());
    let source = SyntheticPatchSource::new(3, 16, 0);
    let mut trainer = ContrastiveTrainer::new(config.clone(), backbone(&config)).unwrap();
    assert!(matches!(
        trainer.run(&source),
        Err(TrainError::NotEnoughPatches { len: 3, batch_size: 4 })
    ));
}

#[test]
fn head_input_width_follows_the_backbone() {
    let tmp = tempdir().unwrap();
    let config = tiny_config(tmp.path());
    let narrow: Arc<dyn FeatureExtractor> = Arc::new(RandomProjectionBackbone::new(3, 2, 7, 0).unwrap());
    let trainer = ContrastiveTrainer::new(config, narrow).unwrap();
    assert_eq!(trainer.encoders().online().config().in_width, 7);
}

#[test]
fn invalid_config_is_rejected_before_training() {
    let tmp = tempdir().unwrap();
    let mut config = tiny_config(tmp.path());
    config.training.batch_size = 1;
    assert!(matches!(
        ContrastiveTrainer::new(config.clone(), backbone(&config)),
        Err(TrainError::Config(_))
    ));
}
