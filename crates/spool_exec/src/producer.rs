//! Producer side: record sources and the worker loop that feeds the queue.
//!
//! A `Producer` pushes raw records into a `RecordSink`. The sink owned by the
//! worker applies the transform and inserts into the bounded queue, so
//! pull-based (`IteratorProducer`) and push-based (`FnProducer`) sources
//! share one loop.

use std::sync::Arc;

use thiserror::Error;

use spool_common::crash_domain;
use spool_common::error::{BoxError, QueueError, WorkerError, WorkerRole};
use spool_common::interrupt::{self, InterruptFlag};

use crate::failure::FailureSlot;
use crate::queue::BoundedQueue;

/// Transform applied to every raw record before it is queued.
pub type Transform<I, O> = Arc<dyn Fn(I) -> Result<O, BoxError> + Send + Sync>;

/// Hook run once on every worker thread before its main loop, e.g. to
/// re-establish caller thread-local context on the new thread.
pub type InitHook = Arc<dyn Fn() + Send + Sync>;

/// Why a producer must stop pushing records.
#[derive(Error, Debug)]
pub enum Halt {
    /// Queue closed or worker interrupted. Normal during shutdown.
    #[error("producer cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(WorkerError),
}

/// Destination for raw records.
pub trait RecordSink<I> {
    fn accept(&mut self, record: I) -> Result<(), Halt>;
}

/// A source of raw records, run on its own worker thread.
pub trait Producer<I>: Send {
    fn produce(&mut self, sink: &mut dyn RecordSink<I>) -> Result<(), Halt>;
}

/// Pulls from any iterator, finite or not.
pub struct IteratorProducer<T> {
    iter: T,
}

impl<T> IteratorProducer<T> {
    pub fn new(iter: impl IntoIterator<IntoIter = T>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I, T> Producer<I> for IteratorProducer<T>
where
    T: Iterator<Item = I> + Send,
{
    fn produce(&mut self, sink: &mut dyn RecordSink<I>) -> Result<(), Halt> {
        for record in self.iter.by_ref() {
            sink.accept(record)?;
        }
        Ok(())
    }
}

/// Pulls from an iterator of `Result`s; the first `Err` stops the producer
/// as a source failure.
pub struct FallibleIteratorProducer<T> {
    iter: T,
}

impl<T> FallibleIteratorProducer<T> {
    pub fn new(iter: impl IntoIterator<IntoIter = T>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I, E, T> Producer<I> for FallibleIteratorProducer<T>
where
    T: Iterator<Item = Result<I, E>> + Send,
    E: Into<BoxError>,
{
    fn produce(&mut self, sink: &mut dyn RecordSink<I>) -> Result<(), Halt> {
        for item in self.iter.by_ref() {
            let record = item.map_err(|e| Halt::Failed(WorkerError::Source(e.into())))?;
            sink.accept(record)?;
        }
        Ok(())
    }
}

/// Push-based source: the closure receives the sink and pushes records.
///
/// Errors from `sink.accept` can be propagated with `?`; they are recognised
/// and keep their meaning. Any other error is a source failure.
pub struct FnProducer<F> {
    f: F,
}

impl<F> FnProducer<F> {
    pub fn new<I>(f: F) -> Self
    where
        F: FnMut(&mut dyn RecordSink<I>) -> Result<(), BoxError> + Send,
    {
        Self { f }
    }
}

impl<I, F> Producer<I> for FnProducer<F>
where
    F: FnMut(&mut dyn RecordSink<I>) -> Result<(), BoxError> + Send,
{
    fn produce(&mut self, sink: &mut dyn RecordSink<I>) -> Result<(), Halt> {
        (self.f)(sink).map_err(|err| match err.downcast::<Halt>() {
            Ok(halt) => *halt,
            Err(other) => Halt::Failed(WorkerError::Source(other)),
        })
    }
}

/// Sink used by producer workers: transform, then insert.
struct QueueSink<'a, I, O> {
    worker: &'a str,
    transform: &'a Transform<I, O>,
    queue: &'a BoundedQueue<O>,
    produced: u64,
}

impl<I, O> RecordSink<I> for QueueSink<'_, I, O> {
    fn accept(&mut self, record: I) -> Result<(), Halt> {
        if interrupt::is_interrupted() {
            return Err(Halt::Cancelled);
        }
        let transform = self.transform;
        let entry = crash_domain::catch_stage("transform", self.worker, || transform(record))
            .map_err(Halt::Failed)?
            .map_err(|e| Halt::Failed(WorkerError::Transform(e)))?;
        match self.queue.insert(entry) {
            Ok(()) => {
                self.produced += 1;
                Ok(())
            }
            Err(QueueError::Closed) => Err(Halt::Cancelled),
        }
    }
}

/// Marks the producer done however the worker exits, so the consumer can
/// never wait on a producer that silently died.
struct ProducerDoneGuard<'a, O> {
    queue: &'a BoundedQueue<O>,
}

impl<O> Drop for ProducerDoneGuard<'_, O> {
    fn drop(&mut self) {
        self.queue.mark_producer_done();
    }
}

/// One producer worker.
pub(crate) struct ProducerTask<I, O> {
    pub index: usize,
    pub name: String,
    pub producer: Box<dyn Producer<I>>,
    pub transform: Transform<I, O>,
    pub queue: Arc<BoundedQueue<O>>,
    pub failure: Arc<FailureSlot>,
    pub init_hook: Option<InitHook>,
    pub interrupt: InterruptFlag,
}

impl<I, O> ProducerTask<I, O> {
    /// Worker thread body. Never panics past this frame.
    pub fn run(self) {
        let ProducerTask {
            index,
            name,
            mut producer,
            transform,
            queue,
            failure,
            init_hook,
            interrupt: flag,
        } = self;
        let role = WorkerRole::Producer(index);
        interrupt::install(flag);
        let _done = ProducerDoneGuard { queue: &queue };

        if let Some(hook) = init_hook {
            if let Err(e) = crash_domain::catch_stage("pre_execute", &name, || hook()) {
                failure.record(role, e);
                return;
            }
        }
        tracing::debug!(worker = %name, "producer started");

        let mut sink = QueueSink {
            worker: &name,
            transform: &transform,
            queue: &queue,
            produced: 0,
        };
        let outcome = crash_domain::catch_stage("produce", &name, || producer.produce(&mut sink));
        let produced = sink.produced;
        spool_observability::record_produced(&name, produced);

        match outcome {
            Ok(Ok(())) => tracing::debug!(worker = %name, produced, "producer finished"),
            Ok(Err(Halt::Cancelled)) => {
                tracing::debug!(worker = %name, produced, "producer cancelled")
            }
            Ok(Err(Halt::Failed(e))) | Err(e) => {
                failure.record(role, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink(Vec<u32>);

    impl RecordSink<u32> for VecSink {
        fn accept(&mut self, record: u32) -> Result<(), Halt> {
            if record == 99 {
                return Err(Halt::Cancelled);
            }
            self.0.push(record);
            Ok(())
        }
    }

    #[test]
    fn test_iterator_producer_drains() {
        let mut p = IteratorProducer::new(vec![1u32, 2, 3]);
        let mut sink = VecSink::default();
        p.produce(&mut sink).unwrap();
        assert_eq!(sink.0, vec![1, 2, 3]);
    }

    #[test]
    fn test_iterator_producer_stops_on_halt() {
        let mut p = IteratorProducer::new(vec![1u32, 99, 3]);
        let mut sink = VecSink::default();
        assert!(matches!(p.produce(&mut sink), Err(Halt::Cancelled)));
        assert_eq!(sink.0, vec![1]);
    }

    #[test]
    fn test_fallible_producer_source_error() {
        let items: Vec<Result<u32, String>> = vec![Ok(1), Err("corrupt block".into()), Ok(3)];
        let mut p = FallibleIteratorProducer::new(items);
        let mut sink = VecSink::default();
        match p.produce(&mut sink) {
            Err(Halt::Failed(WorkerError::Source(e))) => {
                assert!(e.to_string().contains("corrupt block"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.0, vec![1]);
    }

    #[test]
    fn test_fn_producer_preserves_halt() {
        let mut p = FnProducer::new(|sink: &mut dyn RecordSink<u32>| {
            sink.accept(5)?;
            sink.accept(99)?;
            sink.accept(6)?;
            Ok(())
        });
        let mut sink = VecSink::default();
        assert!(matches!(p.produce(&mut sink), Err(Halt::Cancelled)));
        assert_eq!(sink.0, vec![5]);
    }

    #[test]
    fn test_fn_producer_other_error_is_source_failure() {
        let mut p = FnProducer::new(|_sink: &mut dyn RecordSink<u32>| Err("socket reset".into()));
        let mut sink = VecSink::default();
        assert!(matches!(
            p.produce(&mut sink),
            Err(Halt::Failed(WorkerError::Source(_)))
        ));
    }
}
