//! Consumer side: the caller's sink for queued entries and its worker loop.

use std::sync::mpsc;
use std::sync::Arc;

use spool_common::crash_domain;
use spool_common::error::{BoxError, WorkerError, WorkerRole};
use spool_common::interrupt::{self, InterruptFlag};

use crate::failure::FailureSlot;
use crate::producer::InitHook;
use crate::queue::{BoundedQueue, QueueState};

/// Receives queued entries one at a time on a single worker thread.
///
/// `consume` is never called concurrently with itself. State the consumer
/// shares with the outside world (open writers, file handles) is *not*
/// protected by the engine: close it only after `shutdown_now()` and
/// `await_termination()` have both returned.
pub trait Consumer<O>: Send {
    type Output;

    fn consume(&mut self, entry: O) -> Result<(), BoxError>;

    /// Called once after the queue drained, before `result`.
    fn finish(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called exactly once, after a successful `finish`.
    fn result(&mut self) -> Self::Output;
}

/// Sent from workers to the thread blocked in `execute()`.
pub(crate) enum Signal<E> {
    Finished(E),
    Failed,
}

/// The single consumer worker.
pub(crate) struct ConsumerTask<O, E> {
    pub name: String,
    pub consumer: Box<dyn Consumer<O, Output = E>>,
    pub queue: Arc<BoundedQueue<O>>,
    pub failure: Arc<FailureSlot>,
    pub init_hook: Option<InitHook>,
    pub interrupt: InterruptFlag,
    pub done_tx: mpsc::Sender<Signal<E>>,
}

impl<O, E> ConsumerTask<O, E> {
    /// Worker thread body. Never panics past this frame.
    pub fn run(self) {
        let ConsumerTask {
            name,
            mut consumer,
            queue,
            failure,
            init_hook,
            interrupt: flag,
            done_tx,
        } = self;
        interrupt::install(flag);

        if let Some(hook) = init_hook {
            if let Err(e) = crash_domain::catch_stage("pre_execute", &name, || hook()) {
                failure.record(WorkerRole::Consumer, e);
                return;
            }
        }
        tracing::debug!(worker = %name, "consumer started");

        let outcome =
            crash_domain::catch_stage("consume", &name, || drain(consumer.as_mut(), &queue));
        match outcome {
            Ok(Ok((result, consumed))) => {
                tracing::debug!(worker = %name, consumed, "consumer finished");
                // The receiver is gone only if the executor was dropped.
                let _ = done_tx.send(Signal::Finished(result));
            }
            Ok(Err(e)) | Err(e) => {
                failure.record(WorkerRole::Consumer, e);
            }
        }
    }
}

fn drain<O, E>(
    consumer: &mut dyn Consumer<O, Output = E>,
    queue: &BoundedQueue<O>,
) -> Result<(E, u64), WorkerError> {
    let mut consumed = 0u64;
    let mut entries = queue.iter();
    for entry in entries.by_ref() {
        consumer.consume(entry).map_err(WorkerError::Consume)?;
        consumed += 1;
    }
    spool_observability::record_consumed(consumed);
    if entries.end_state() != Some(QueueState::Done) {
        return Err(WorkerError::Interrupted);
    }
    consumer.finish().map_err(WorkerError::Finish)?;
    Ok((consumer.result(), consumed))
}
