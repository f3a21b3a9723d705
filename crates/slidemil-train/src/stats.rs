//! Loop-control statistics: running loss, early stopping and the checkpoint
//! schedule. None of these touch I/O; the trainer decides what to log and
//! write based on their answers.

/// Incremental mean: `avg ← avg + (x − avg) / (n + 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningAverage {
    value: f32,
    count: usize,
}

impl RunningAverage {
    /// Empty average.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one observation and return the new average.
    pub fn update(&mut self, x: f32) -> f32 {
        self.value += (x - self.value) / (self.count + 1) as f32;
        self.count += 1;
        self.value
    }

    /// Current average (0 before the first update).
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Number of observations.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Forget all observations.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of [`EarlyStopping::observe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// The loss beat the previous best.
    Improved {
        /// Best loss before this observation.
        previous: f32,
        /// New best loss.
        best: f32,
    },
    /// The loss did not beat the best.
    NotImproved {
        /// Best loss so far.
        best: f32,
    },
}

/// Tracks the best loss and counts consecutive epochs without improvement.
///
/// Losses are observed at checkpoint evaluations; the counter advances at
/// [`EarlyStopping::end_epoch`] when no observation of that epoch improved.
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopping {
    patience: usize,
    best: f32,
    stale_epochs: usize,
    improved_this_epoch: bool,
}

impl EarlyStopping {
    /// Stop after `patience` consecutive epochs without improvement.
    pub fn new(patience: usize) -> Self {
        EarlyStopping {
            patience,
            best: f32::INFINITY,
            stale_epochs: 0,
            improved_this_epoch: false,
        }
    }

    /// Compare `loss` to the best so far. Non-finite losses never improve.
    pub fn observe(&mut self, loss: f32) -> Observation {
        if loss.is_finite() && loss < self.best {
            let previous = self.best;
            self.best = loss;
            self.stale_epochs = 0;
            self.improved_this_epoch = true;
            Observation::Improved { previous, best: loss }
        } else {
            Observation::NotImproved { best: self.best }
        }
    }

    /// Close the epoch and return the number of consecutive stale epochs.
    pub fn end_epoch(&mut self) -> usize {
        if !self.improved_this_epoch {
            self.stale_epochs += 1;
        }
        self.improved_this_epoch = false;
        self.stale_epochs
    }

    /// `true` once `patience` consecutive epochs passed without improvement.
    pub fn should_stop(&self) -> bool {
        self.stale_epochs >= self.patience
    }

    /// Best loss observed so far (`inf` before any observation).
    pub fn best(&self) -> f32 {
        self.best
    }

    /// Consecutive epochs without improvement.
    pub fn stale_epochs(&self) -> usize {
        self.stale_epochs
    }
}

/// Fixed-interval checkpoint schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    interval: usize,
}

impl CheckpointPolicy {
    /// Evaluate every `interval` steps; `0` is treated as 1.
    pub fn new(interval: usize) -> Self {
        CheckpointPolicy { interval: interval.max(1) }
    }

    /// Steps between evaluations.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// `true` when `completed_steps` (1-based count within the epoch) is a
    /// multiple of the interval.
    pub fn is_due(&self, completed_steps: usize) -> bool {
        completed_steps > 0 && completed_steps % self.interval == 0
    }
}
