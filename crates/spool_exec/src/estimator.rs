//! Entry footprint estimation and byte-budget → entry-count conversion.
//!
//! Measuring every entry (walking its heap allocations) is too expensive on
//! the write path, so the queue samples: the first `sample_warmup` entries
//! are measured individually, after that only one entry in `sample_rate`.
//! Each measurement is folded into a running average and the effective
//! capacity is recomputed as `clamp(budget / avg, 1, max_cached_records)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deepsize::DeepSizeOf;

use spool_common::config::ExecutorConfig;

/// Approximate in-memory footprint of a queued entry, in bytes.
pub trait SizeEstimator<O>: Send + Sync {
    fn estimate(&self, entry: &O) -> u64;
}

/// Heap-inclusive size via `DeepSizeOf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeepSizeEstimator;

impl<O: DeepSizeOf> SizeEstimator<O> for DeepSizeEstimator {
    fn estimate(&self, entry: &O) -> u64 {
        entry.deep_size_of() as u64
    }
}

/// Caller-supplied sizing closure, e.g. a serialized-length approximation.
pub struct FnEstimator<F>(pub F);

impl<O, F> SizeEstimator<O> for FnEstimator<F>
where
    F: Fn(&O) -> u64 + Send + Sync,
{
    fn estimate(&self, entry: &O) -> u64 {
        (self.0)(entry)
    }
}

/// Decides which entries get measured. Lock-free so producers can measure
/// outside the queue lock.
pub struct SizeSampler<O> {
    estimator: Arc<dyn SizeEstimator<O>>,
    warmup: u64,
    rate: u64,
    seen: AtomicU64,
}

impl<O> SizeSampler<O> {
    pub fn new(estimator: Arc<dyn SizeEstimator<O>>, config: &ExecutorConfig) -> Self {
        Self {
            estimator,
            warmup: config.sample_warmup,
            rate: config.sample_rate.max(1),
            seen: AtomicU64::new(0),
        }
    }

    /// Measure `entry` if it falls on a sampling point. Zero-sized entries
    /// count as one byte.
    pub fn sample(&self, entry: &O) -> Option<u64> {
        let seq = self.seen.fetch_add(1, Ordering::Relaxed);
        let due = seq < self.warmup || (seq - self.warmup) % self.rate == 0;
        if due {
            Some(self.estimator.estimate(entry).max(1))
        } else {
            None
        }
    }

    /// Entries offered to `sample` so far.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

/// Running average of sampled sizes and the capacity derived from it.
#[derive(Debug, Clone)]
pub struct CapacityModel {
    budget_bytes: u64,
    max_records: usize,
    samples: u64,
    avg_bytes: f64,
    capacity: usize,
}

impl CapacityModel {
    /// No samples yet: capacity starts at one entry.
    pub fn new(budget_bytes: u64, max_records: usize) -> Self {
        Self {
            budget_bytes,
            max_records: max_records.max(1),
            samples: 0,
            avg_bytes: 0.0,
            capacity: 1,
        }
    }

    /// Fold one measurement in. Returns true if capacity changed.
    pub fn observe(&mut self, bytes: u64) -> bool {
        self.samples += 1;
        self.avg_bytes += (bytes as f64 - self.avg_bytes) / self.samples as f64;
        let avg = self.avg_bytes.max(1.0);
        let raw = (self.budget_bytes as f64 / avg).floor() as usize;
        let next = raw.clamp(1, self.max_records);
        let changed = next != self.capacity;
        self.capacity = next;
        changed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rounded running average, 0 before the first sample.
    pub fn avg_bytes(&self) -> u64 {
        self.avg_bytes.round() as u64
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }
}
