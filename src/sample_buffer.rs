//! Rolling history of the most recent heart-rate samples.
//!
//! The buffer is shared between the consumer that fills it (through
//! `EventReceiver::drain_into`) and any reader that wants a `snapshot()`.
//! Cloning a `SampleBuffer` clones the handle, not the samples.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use crate::heart_rate::Sample;

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct SampleBuffer {
    inner: Arc<Mutex<VecDeque<Sample>>>,
    capacity: usize,
}

impl SampleBuffer {
    /// Creates an empty buffer holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to read.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Sample>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, sample: Sample) {
        let mut samples = self.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Oldest-first copy of the current contents
    pub fn snapshot(&self) -> Vec<Sample> {
        self.lock().iter().copied().collect()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.lock().back().copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lowest and highest BPM currently held, for scaling a chart axis
    pub fn bpm_range(&self) -> Option<(u16, u16)> {
        self.lock().iter().fold(None, |acc, sample| match acc {
            None => Some((sample.bpm, sample.bpm)),
            Some((min, max)) => Some((min.min(sample.bpm), max.max(sample.bpm))),
        })
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
