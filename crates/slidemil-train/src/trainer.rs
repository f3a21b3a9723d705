//! Momentum-contrastive training loop.
//!
//! One step, strictly in this order:
//!
//! ```text
//! x_q ─► backbone ─► online head ─► normalise ─► q ─┐
//!                                                   ├─► contrastive loss ◄── dictionary
//! x_k ─► shuffle ─► backbone ─► momentum head ─►     │
//!        normalise ─► restore order ─► k ───────────┘
//!
//! backward (online head only) ─► SGD step ─► momentum sync ─► dictionary.update(k)
//! ```
//!
//! At the start of every epoch the dictionary is rebuilt from the momentum
//! encoder over a freshly shuffled pass of second views. Checkpoints are
//! evaluated every `checkpoint_interval` steps and at the end of each epoch;
//! early stopping is checked between epochs.

use ndarray::{Array2, ArrayView3};
use rand::rngs::StdRng;
use slidemil_nn::projection::{l2_normalize_backward, l2_normalize_rows};
use slidemil_nn::{FeatureExtractor, Parameterized, ProjectionHead};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::augment::ViewAugmenter;
use crate::checkpoint::{CheckpointKind, EncoderCheckpointer};
use crate::config::{NonFinitePolicy, PretrainConfig};
use crate::dataset::{PatchSource, ViewBatch, ViewPairLoader};
use crate::error::{LossError, TrainError, TrainResult};
use crate::losses::contrastive_loss;
use crate::momentum::{BatchShuffle, BufferSnapshot, EncoderPair};
use crate::optim::Sgd;
use crate::queue::KeyDictionary;
use crate::stats::{CheckpointPolicy, EarlyStopping, Observation, RunningAverage};

const HEAD_INIT_STREAM: u64 = 1;
const SHUFFLE_STREAM: u64 = 2;
const WARMUP_STREAM: u64 = 3;
const TRAIN_STREAM: u64 = 4;

/// Metrics of one completed step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Contrastive loss of the step.
    pub loss: f32,
    /// Fraction of queries whose positive key scored highest.
    pub top1_accuracy: f32,
}

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Completed steps.
    pub steps: usize,
    /// Steps skipped because of a non-finite loss.
    pub skipped_steps: usize,
    /// Running mean of the step losses.
    pub mean_loss: f32,
    /// Running mean of the top-1 accuracy.
    pub top1_accuracy: f32,
    /// Dictionary size at the end of the epoch.
    pub dictionary_len: usize,
    /// Best checkpointed loss so far.
    pub best_loss: f32,
}

/// Result of [`ContrastiveTrainer::run`].
#[derive(Debug, Clone)]
pub struct PretrainSummary {
    /// Per-epoch statistics.
    pub history: Vec<EpochStats>,
    /// Best checkpointed running loss.
    pub best_loss: f32,
    /// `true` when patience ran out before the epoch budget.
    pub stopped_early: bool,
    /// Wall-clock duration.
    pub total_time_secs: f64,
}

/// Owns the encoder pair, optimiser, dictionary and loop-control state of a
/// pretraining run.
pub struct ContrastiveTrainer {
    config: PretrainConfig,
    encoders: EncoderPair,
    optimizer: Sgd,
    dictionary: KeyDictionary,
    early_stopping: EarlyStopping,
    checkpoint_policy: CheckpointPolicy,
    checkpointer: EncoderCheckpointer,
    shuffle_rng: StdRng,
    global_step: usize,
}

impl ContrastiveTrainer {
    /// Validate `config`, build the online head on top of `backbone` and copy
    /// it into the momentum encoder.
    pub fn new(config: PretrainConfig, backbone: Arc<dyn FeatureExtractor>) -> TrainResult<Self> {
        config.validate()?;
        let t = &config.training;
        let head_config = t.projection_config(backbone.embedding_width());
        let online = ProjectionHead::new(head_config, &mut config.run.stream(HEAD_INIT_STREAM))?;
        let encoders = EncoderPair::new(backbone, online)?;

        let trainable = encoders.online().num_parameters();
        let buffers: usize = encoders.online().buffers().iter().map(|(_, v)| v.len()).sum();
        info!("{} total parameters.", trainable + buffers);
        info!("{} training parameters.", trainable);

        Ok(ContrastiveTrainer {
            optimizer: Sgd::new(t.learning_rate, t.sgd_momentum, t.weight_decay),
            dictionary: KeyDictionary::new(t.num_keys, t.moco_dim),
            early_stopping: EarlyStopping::new(t.early_stop_patience),
            checkpoint_policy: CheckpointPolicy::new(t.checkpoint_interval),
            checkpointer: EncoderCheckpointer::new(config.checkpoint_dir()),
            shuffle_rng: config.run.stream(SHUFFLE_STREAM),
            global_step: 0,
            encoders,
            config,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &PretrainConfig {
        &self.config
    }

    /// Encoder pair.
    pub fn encoders(&self) -> &EncoderPair {
        &self.encoders
    }

    /// Current negative-key dictionary.
    pub fn dictionary(&self) -> &KeyDictionary {
        &self.dictionary
    }

    /// Steps completed over the whole run.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Train on `source` until the epoch budget is spent or early stopping
    /// triggers. Writes the config copy and the encoder checkpoints.
    pub fn run(&mut self, source: &dyn PatchSource) -> TrainResult<PretrainSummary> {
        let batch_size = self.config.training.batch_size;
        if source.len() < batch_size {
            return Err(TrainError::NotEnoughPatches { len: source.len(), batch_size });
        }
        self.config.to_json(&self.config.config_copy_path())?;

        let pool = self.config.run.thread_pool()?;
        pool.install(|| self.run_epochs(source))
    }

    fn run_epochs(&mut self, source: &dyn PatchSource) -> TrainResult<PretrainSummary> {
        let start = Instant::now();
        let augmenter = ViewAugmenter::new(self.config.augmentation.clone(), &self.config.dataset);
        let run = self.config.run;
        let batch_size = self.config.training.batch_size;
        let train_loader = ViewPairLoader::new(source, &augmenter, batch_size, run.stream_seed(TRAIN_STREAM));
        let warmup_loader = ViewPairLoader::new(source, &augmenter, batch_size, run.stream_seed(WARMUP_STREAM));

        info!(
            "Start training: {} patches from {}, {} steps per epoch, up to {} epochs",
            source.len(),
            source.name(),
            train_loader.num_batches(),
            self.config.training.epochs
        );

        let mut history = Vec::new();
        let mut stopped_early = false;
        for epoch in 0..self.config.training.epochs {
            self.warm_up_dictionary(&warmup_loader, epoch)?;
            let stats = self.train_epoch(&train_loader, epoch)?;
            info!(
                "epoch {} train loss: {:.5} (top-1 {:.3}, {} steps, {} skipped)",
                stats.epoch, stats.mean_loss, stats.top1_accuracy, stats.steps, stats.skipped_steps
            );
            history.push(stats);
            if self.early_stopping.should_stop() {
                warn!(
                    "EARLY STOPPING after epoch {}: no improvement for {} epochs (best loss {:.5})",
                    epoch,
                    self.early_stopping.stale_epochs(),
                    self.early_stopping.best()
                );
                stopped_early = true;
                break;
            }
        }

        Ok(PretrainSummary {
            history,
            best_loss: self.early_stopping.best(),
            stopped_early,
            total_time_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Rebuild the dictionary from momentum-encoded second views. Under
    /// [`NonFinitePolicy::Skip`] batches with non-finite keys are left out.
    pub fn warm_up_dictionary(&mut self, loader: &ViewPairLoader<'_>, epoch: usize) -> TrainResult<()> {
        let t = &self.config.training;
        let (capacity, dim) = (t.num_keys, t.moco_dim);
        let skip = t.non_finite == NonFinitePolicy::Skip;
        info!("Initializing a queue with {} keys.", capacity);
        let mut batches = loader.epoch(epoch);
        let dictionary = KeyDictionary::initialize(capacity, dim, || loop {
            match batches.next() {
                Some(Ok(batch)) => match self.encode_keys(&batch.key_views()) {
                    Ok(keys) => return Ok(Some(keys)),
                    Err(e) if skip && e.is_numerical() => warn!("Skipping warm-up batch: {e}"),
                    Err(e) => return Err(e),
                },
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        })?;
        self.dictionary = dictionary;
        Ok(())
    }

    /// One pass over `loader`, with checkpoint evaluation and the early-stop
    /// bookkeeping for the epoch.
    pub fn train_epoch(&mut self, loader: &ViewPairLoader<'_>, epoch: usize) -> TrainResult<EpochStats> {
        let mut loss_avg = RunningAverage::new();
        let mut acc_avg = RunningAverage::new();
        let mut skipped = 0usize;
        let mut last_evaluated = 0usize;

        for batch in loader.epoch(epoch) {
            let batch = batch?;
            match self.step(&batch) {
                Ok(outcome) => {
                    loss_avg.update(outcome.loss);
                    acc_avg.update(outcome.top1_accuracy);
                    debug!(
                        "[Epoch : {} / Total iters : {}] : loss_moco : {:.5}",
                        epoch,
                        loss_avg.count(),
                        loss_avg.value()
                    );
                }
                Err(e) if e.is_numerical() && self.config.training.non_finite == NonFinitePolicy::Skip => {
                    warn!("Skipping step: {e}");
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self.checkpoint_policy.is_due(loss_avg.count()) {
                self.evaluate_checkpoint(loss_avg.value())?;
                last_evaluated = loss_avg.count();
            }
        }

        if loss_avg.count() > 0 && last_evaluated != loss_avg.count() {
            self.evaluate_checkpoint(loss_avg.value())?;
        }
        self.early_stopping.end_epoch();

        Ok(EpochStats {
            epoch,
            steps: loss_avg.count(),
            skipped_steps: skipped,
            mean_loss: loss_avg.value(),
            top1_accuracy: acc_avg.value(),
            dictionary_len: self.dictionary.len(),
            best_loss: self.early_stopping.best(),
        })
    }

    /// One optimisation step on an index-aligned batch of view pairs.
    ///
    /// Non-finite features, embeddings, loss or gradients fail the step with
    /// [`LossError::NonFinite`]. On any error the parameters, the dictionary
    /// and the batch-norm running statistics of both heads are left as they
    /// were.
    pub fn step(&mut self, batch: &ViewBatch) -> TrainResult<StepOutcome> {
        let online_buffers = BufferSnapshot::take(self.encoders.online());
        let momentum_buffers = BufferSnapshot::take(self.encoders.momentum().get());
        match self.try_step(batch) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                online_buffers.restore(self.encoders.online_mut())?;
                self.encoders.momentum_mut().restore_buffers(&momentum_buffers)?;
                Err(e)
            }
        }
    }

    fn try_step(&mut self, batch: &ViewBatch) -> TrainResult<StepOutcome> {
        let step = self.global_step;

        let features_q = self.encoders.backbone().forward_batch(&batch.query_views())?;
        ensure_finite(features_q.iter(), step)?;
        let (z_q, cache) = self.encoders.online_mut().forward_train(features_q.view())?;
        let (q, q_norms) = l2_normalize_rows(z_q.view());
        ensure_finite(q.iter(), step)?;

        let k = self.encode_keys(&batch.key_views())?;

        let loss = contrastive_loss(
            q.view(),
            k.view(),
            self.dictionary.keys(),
            self.config.training.temperature,
        )
        .map_err(|e| match e {
            LossError::NonFinite { value, .. } => LossError::NonFinite { value, step },
            other => other,
        })?;

        let grad_z = l2_normalize_backward(q.view(), &q_norms, loss.grad_queries.view());
        let grads = self.encoders.online().backward(&cache, grad_z.view())?;
        for (_, g) in &grads {
            ensure_finite(g.iter(), step)?;
        }
        self.optimizer.step(self.encoders.online_mut().parameters_mut(), &grads)?;

        self.encoders.sync(self.config.training.moco_m)?;
        self.dictionary.update(k.view())?;
        self.global_step += 1;

        Ok(StepOutcome { loss: loss.loss, top1_accuracy: loss.top1_accuracy })
    }

    /// Momentum-encode key views through a batch shuffle and return unit
    /// keys in the original batch order.
    ///
    /// Non-finite features or keys fail with [`LossError::NonFinite`] and
    /// leave the momentum running statistics unchanged.
    pub fn encode_keys(&mut self, views: &[ArrayView3<'_, f32>]) -> TrainResult<Array2<f32>> {
        let step = self.global_step;
        let shuffle = BatchShuffle::random(views.len(), &mut self.shuffle_rng);
        let shuffled = shuffle.apply_slice(views)?;
        let features = self.encoders.backbone().forward_batch(&shuffled)?;
        ensure_finite(features.iter(), step)?;

        let saved = BufferSnapshot::take(self.encoders.momentum().get());
        let z = self.encoders.momentum_mut().project(features.view())?;
        let (k, _) = l2_normalize_rows(z.view());
        if let Err(e) = ensure_finite(k.iter(), step) {
            self.encoders.momentum_mut().restore_buffers(&saved)?;
            return Err(e.into());
        }
        Ok(shuffle.restore(k.view())?)
    }

    fn evaluate_checkpoint(&mut self, running_loss: f32) -> TrainResult<()> {
        match self.early_stopping.observe(running_loss) {
            Observation::Improved { previous, best } => {
                info!("=> Saving a new best model (previous loss: {previous:.5}, new loss: {best:.5})");
                self.checkpointer.save(self.encoders.online(), CheckpointKind::Best)?;
            }
            Observation::NotImproved { best } => {
                debug!("No improvement over {best:.5}; saving temporary encoder");
                self.checkpointer.save(self.encoders.online(), CheckpointKind::Temporary)?;
            }
        }
        Ok(())
    }
}

/// First NaN or infinity in `values`, as a step failure.
fn ensure_finite<'a>(values: impl IntoIterator<Item = &'a f32>, step: usize) -> Result<(), LossError> {
    match values.into_iter().find(|v| !v.is_finite()) {
        Some(&value) => Err(LossError::NonFinite { value, step }),
        None => Ok(()),
    }
}
