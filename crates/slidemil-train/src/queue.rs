//! Bounded dictionary of negative keys.
//!
//! Rows are kept newest first: [`KeyDictionary::update`] puts the incoming
//! batch at the front and truncates the tail, so the oldest keys are the ones
//! evicted. Before the dictionary is full, updates simply grow it.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use tracing::info;

use crate::error::{LossError, TrainResult};

/// FIFO key store with fixed capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDictionary {
    keys: Array2<f32>,
    capacity: usize,
}

impl KeyDictionary {
    /// Empty dictionary of `dim`-wide keys holding at most `capacity` rows.
    pub fn new(capacity: usize, dim: usize) -> Self {
        KeyDictionary { keys: Array2::zeros((0, dim)), capacity }
    }

    /// Fill a fresh dictionary from successive key batches until `capacity`
    /// keys have been collected or `next_batch` runs dry.
    ///
    /// Batches must already be unit-normalised. A short fill is the warm-up
    /// state, not an error.
    pub fn initialize<F>(capacity: usize, dim: usize, mut next_batch: F) -> TrainResult<Self>
    where
        F: FnMut() -> TrainResult<Option<Array2<f32>>>,
    {
        let mut dict = KeyDictionary::new(capacity, dim);
        while !dict.is_full() {
            match next_batch()? {
                Some(batch) => dict.update(batch.view())?,
                None => break,
            }
        }
        info!("Key dictionary initialised with {} of {} keys", dict.len(), capacity);
        Ok(dict)
    }

    /// Prepend `new_keys` and drop the oldest rows beyond capacity.
    pub fn update(&mut self, new_keys: ArrayView2<'_, f32>) -> TrainResult<()> {
        if new_keys.ncols() != self.dim() {
            return Err(LossError::ShapeMismatch {
                context: "KeyDictionary::update",
                expected: vec![new_keys.nrows(), self.dim()],
                actual: new_keys.shape().to_vec(),
            }
            .into());
        }
        let incoming = new_keys.nrows();
        let merged = concatenate(Axis(0), &[new_keys.view(), self.keys.view()]).map_err(|_| {
            LossError::ShapeMismatch {
                context: "KeyDictionary::update",
                expected: vec![incoming, self.dim()],
                actual: vec![incoming, self.keys.ncols()],
            }
        })?;
        let keep = merged.nrows().min(self.capacity);
        let kept = merged.slice(s![..keep, ..]).to_owned();
        self.keys = kept;
        Ok(())
    }

    /// Current keys, newest first.
    pub fn keys(&self) -> ArrayView2<'_, f32> {
        self.keys.view()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.keys.nrows()
    }

    /// `true` when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.keys.nrows() == 0
    }

    /// Maximum number of keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Key width.
    pub fn dim(&self) -> usize {
        self.keys.ncols()
    }

    /// `true` once `len == capacity`.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
