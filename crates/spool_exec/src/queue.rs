//! Memory-bounded blocking queue between producer workers and the consumer.
//!
//! The queue is bounded by an *estimated byte budget*, not a record count:
//! the `CapacityModel` turns the budget and the running average entry size
//! into an effective entry-count capacity, recomputed as samples arrive.
//!
//! States:
//! - `Open`:     at least one registered producer is still running
//! - `Draining`: every producer is done, entries remain buffered
//! - `Done`:     every producer is done and the buffer is empty
//! - `Closed`:   cancelled; buffered entries were dropped
//!
//! There is no way back to `Open` from `Done` or `Closed`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use spool_common::config::ExecutorConfig;
use spool_common::error::QueueError;

use crate::estimator::{CapacityModel, SizeEstimator, SizeSampler};

/// Lifecycle state of a `BoundedQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Open,
    Draining,
    Done,
    Closed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Open => "open",
            QueueState::Draining => "draining",
            QueueState::Done => "done",
            QueueState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct QueueInner<O> {
    buffer: VecDeque<O>,
    model: CapacityModel,
    producers_total: usize,
    producers_done: usize,
    closed: bool,
}

impl<O> QueueInner<O> {
    fn producers_finished(&self) -> bool {
        self.producers_done >= self.producers_total
    }

    fn state(&self) -> QueueState {
        if self.closed {
            QueueState::Closed
        } else if !self.producers_finished() {
            QueueState::Open
        } else if self.buffer.is_empty() {
            QueueState::Done
        } else {
            QueueState::Draining
        }
    }
}

/// Multi-producer, single-consumer queue bounded by estimated memory.
pub struct BoundedQueue<O> {
    inner: Mutex<QueueInner<O>>,
    not_full: Condvar,
    not_empty: Condvar,
    sampler: SizeSampler<O>,
    /// Mirror of `buffer.len()` for lock-free `has_remaining`.
    len_hint: AtomicUsize,
}

impl<O> BoundedQueue<O> {
    /// Create a queue expecting `producers` calls to `mark_producer_done`.
    pub fn new(
        config: &ExecutorConfig,
        estimator: Arc<dyn SizeEstimator<O>>,
        producers: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffer: VecDeque::new(),
                model: CapacityModel::new(
                    config.write_buffer_limit_bytes,
                    config.max_cached_records,
                ),
                producers_total: producers,
                producers_done: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            sampler: SizeSampler::new(estimator, config),
            len_hint: AtomicUsize::new(0),
        }
    }

    /// Insert an entry, blocking while the queue is at effective capacity.
    ///
    /// Fails with `QueueError::Closed` if the queue is closed, every
    /// producer already finished, or the queue closes while waiting.
    pub fn insert(&self, entry: O) -> Result<(), QueueError> {
        // Measure outside the lock; estimation may walk the whole entry.
        let sampled = self.sampler.sample(&entry);

        let mut inner = self.inner.lock();
        if let Some(bytes) = sampled {
            if inner.model.observe(bytes) {
                spool_observability::record_avg_entry_bytes(inner.model.avg_bytes());
                tracing::trace!(
                    avg_bytes = inner.model.avg_bytes(),
                    capacity = inner.model.capacity(),
                    "queue capacity recomputed"
                );
                // Capacity may have grown: let other blocked producers re-check.
                self.not_full.notify_all();
            }
        }
        if inner.closed || inner.producers_finished() {
            return Err(QueueError::Closed);
        }

        let mut blocked_since: Option<Instant> = None;
        while !inner.closed && inner.buffer.len() >= inner.model.capacity() {
            blocked_since.get_or_insert_with(Instant::now);
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err(QueueError::Closed);
        }

        inner.buffer.push_back(entry);
        let len = inner.buffer.len();
        let capacity = inner.model.capacity();
        self.len_hint.store(len, Ordering::Release);
        drop(inner);
        self.not_empty.notify_one();

        if let Some(since) = blocked_since {
            spool_observability::record_blocked_insert(since.elapsed().as_micros() as u64);
        }
        spool_observability::record_queue_depth(len, capacity);
        Ok(())
    }

    /// Called once by each producer when its source is exhausted (or it
    /// stopped for any other reason).
    pub fn mark_producer_done(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.producers_done < inner.producers_total,
            "mark_producer_done called more often than producers registered"
        );
        inner.producers_done = (inner.producers_done + 1).min(inner.producers_total);
        if inner.producers_finished() {
            tracing::debug!(
                buffered = inner.buffer.len(),
                "all producers done, queue {}",
                inner.state()
            );
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Blocking pull. `None` once the queue is done or closed.
    pub fn next_entry(&self) -> Option<O> {
        match self.pull() {
            Pull::Entry(entry) => Some(entry),
            Pull::End(_) => None,
        }
    }

    fn pull(&self) -> Pull<O> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Pull::End(QueueState::Closed);
            }
            if let Some(entry) = inner.buffer.pop_front() {
                let len = inner.buffer.len();
                let capacity = inner.model.capacity();
                self.len_hint.store(len, Ordering::Release);
                drop(inner);
                self.not_full.notify_one();
                spool_observability::record_queue_depth(len, capacity);
                return Pull::Entry(entry);
            }
            if inner.producers_finished() {
                return Pull::End(QueueState::Done);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Lazy single-pass draining view for the consumer.
    pub fn iter(&self) -> QueueIter<'_, O> {
        QueueIter {
            queue: self,
            end: None,
        }
    }

    /// Best-effort, non-blocking: are entries buffered right now?
    pub fn has_remaining(&self) -> bool {
        self.len_hint.load(Ordering::Acquire) > 0
    }

    /// Drop buffered entries and wake every waiter. Idempotent, and a no-op
    /// once the queue is `Done`.
    pub fn close(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.state() == QueueState::Done {
                return;
            }
            inner.closed = true;
            self.len_hint.store(0, Ordering::Release);
            std::mem::take(&mut inner.buffer)
        };
        self.not_full.notify_all();
        self.not_empty.notify_all();
        tracing::debug!(dropped = dropped.len(), "queue closed");
        // Entries are dropped here, outside the lock.
        drop(dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state()
    }

    /// Entries currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn effective_capacity(&self) -> usize {
        self.inner.lock().model.capacity()
    }

    /// Running average entry size in bytes (0 before the first sample).
    pub fn average_entry_bytes(&self) -> u64 {
        self.inner.lock().model.avg_bytes()
    }
}

enum Pull<O> {
    Entry(O),
    End(QueueState),
}

/// Blocking iterator over a `BoundedQueue`; ends when the queue is done or
/// closed.
pub struct QueueIter<'a, O> {
    queue: &'a BoundedQueue<O>,
    end: Option<QueueState>,
}

impl<O> QueueIter<'_, O> {
    /// Why iteration stopped: `Done` or `Closed`. `None` while still live.
    pub fn end_state(&self) -> Option<QueueState> {
        self.end
    }
}

impl<O> Iterator for QueueIter<'_, O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        if self.end.is_some() {
            return None;
        }
        match self.queue.pull() {
            Pull::Entry(entry) => Some(entry),
            Pull::End(state) => {
                self.end = Some(state);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::FnEstimator;
    use std::time::Duration;

    fn queue(budget: u64, producers: usize) -> Arc<BoundedQueue<Vec<u8>>> {
        let cfg = ExecutorConfig {
            write_buffer_limit_bytes: budget,
            sample_warmup: 1_000,
            ..Default::default()
        };
        Arc::new(BoundedQueue::new(
            &cfg,
            Arc::new(FnEstimator(|v: &Vec<u8>| v.len() as u64)),
            producers,
        ))
    }

    #[test]
    fn test_fifo_single_producer() {
        let q = queue(1024, 1);
        for i in 0..5u8 {
            q.insert(vec![i; 10]).unwrap();
        }
        q.mark_producer_done();
        assert_eq!(q.state(), QueueState::Draining);
        assert!(q.has_remaining());
        assert!(!q.is_empty());
        let mut iter = q.iter();
        let got: Vec<u8> = iter.by_ref().map(|v| v[0]).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(iter.end_state(), Some(QueueState::Done));
        assert_eq!(q.state(), QueueState::Done);
        assert!(!q.has_remaining());
        assert!(q.is_empty());
    }

    #[test]
    fn test_close_after_done_keeps_done() {
        let q = queue(1024, 1);
        q.insert(vec![7]).unwrap();
        q.mark_producer_done();
        assert_eq!(q.next_entry(), Some(vec![7]));
        assert_eq!(q.state(), QueueState::Done);

        q.close();
        assert_eq!(q.state(), QueueState::Done);
        assert!(!q.is_closed());
        let mut iter = q.iter();
        assert!(iter.next().is_none());
        assert_eq!(iter.end_state(), Some(QueueState::Done));
    }

    #[test]
    fn test_close_while_draining_is_closed() {
        let q = queue(1024, 1);
        q.insert(vec![1]).unwrap();
        q.mark_producer_done();
        q.close();
        assert_eq!(q.state(), QueueState::Closed);
        let mut iter = q.iter();
        assert!(iter.next().is_none());
        assert_eq!(iter.end_state(), Some(QueueState::Closed));
    }

    #[test]
    fn test_capacity_follows_budget() {
        let q = queue(100, 1);
        q.insert(vec![0; 25]).unwrap();
        assert_eq!(q.effective_capacity(), 4);
        assert_eq!(q.average_entry_bytes(), 25);
    }

    #[test]
    fn test_insert_blocks_when_full() {
        let q = queue(100, 1);
        for _ in 0..4 {
            q.insert(vec![0; 25]).unwrap();
        }
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.insert(vec![9; 25]));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished(), "insert should block at capacity");
        assert_eq!(q.len(), 4);

        assert!(q.next_entry().is_some());
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_close_unblocks_producer() {
        let q = queue(10, 1);
        q.insert(vec![0; 10]).unwrap();
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.insert(vec![1; 10]));
        std::thread::sleep(Duration::from_millis(30));
        q.close();
        assert_eq!(handle.join().unwrap(), Err(QueueError::Closed));
        assert_eq!(q.state(), QueueState::Closed);
        assert!(!q.has_remaining());
    }

    #[test]
    fn test_close_unblocks_consumer() {
        let q = queue(1024, 1);
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            let mut iter = q2.iter();
            let first = iter.next();
            (first.is_none(), iter.end_state())
        });
        std::thread::sleep(Duration::from_millis(30));
        q.close();
        assert_eq!(handle.join().unwrap(), (true, Some(QueueState::Closed)));
    }

    #[test]
    fn test_insert_after_close_fails() {
        let q = queue(1024, 1);
        q.close();
        q.close();
        assert_eq!(q.insert(vec![1]), Err(QueueError::Closed));
    }

    #[test]
    fn test_insert_after_all_producers_done_fails() {
        let q = queue(1024, 1);
        q.mark_producer_done();
        assert_eq!(q.state(), QueueState::Done);
        assert_eq!(q.insert(vec![1]), Err(QueueError::Closed));
    }

    #[test]
    fn test_done_requires_every_producer() {
        let q = queue(1024, 2);
        q.insert(vec![1]).unwrap();
        q.mark_producer_done();
        assert_eq!(q.state(), QueueState::Open);
        assert!(q.next_entry().is_some());

        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.next_entry());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished(), "consumer must wait for second producer");
        q.mark_producer_done();
        assert!(handle.join().unwrap().is_none());
        assert_eq!(q.state(), QueueState::Done);
    }

    #[test]
    fn test_zero_producers_is_done() {
        let q = queue(1024, 0);
        assert_eq!(q.state(), QueueState::Done);
        assert!(q.next_entry().is_none());
    }

    #[test]
    fn test_capacity_recomputed_after_warmup() {
        let cfg = ExecutorConfig {
            write_buffer_limit_bytes: 1000,
            sample_warmup: 1,
            sample_rate: 2,
            ..Default::default()
        };
        let q = BoundedQueue::new(
            &cfg,
            Arc::new(FnEstimator(|v: &Vec<u8>| v.len() as u64)),
            1,
        );
        q.insert(vec![0; 100]).unwrap(); // seq 0: sampled, avg 100
        assert_eq!(q.effective_capacity(), 10);
        q.next_entry();
        q.insert(vec![0; 300]).unwrap(); // seq 1: sampled, avg 200
        assert_eq!(q.effective_capacity(), 5);
        q.next_entry();
        q.insert(vec![0; 900]).unwrap(); // seq 2: skipped
        assert_eq!(q.effective_capacity(), 5);
        assert_eq!(q.average_entry_bytes(), 200);
    }
}
