//! Bounded executor: owns the queue and the worker threads of one run.
//!
//! `execute()` spawns one thread per producer plus one consumer thread and
//! blocks the caller until the consumer hands back its result, a worker
//! fails, or the calling thread is interrupted.
//!
//! Shutdown protocol for callers that own resources the consumer touches:
//!
//! ```ignore
//! let outcome = executor.execute();
//! executor.shutdown_now();       // close the queue, interrupt workers
//! executor.await_termination();  // join every worker thread
//! writer.close();                // only now is the consumer guaranteed idle
//! ```
//!
//! Closing consumer-owned resources before `await_termination()` returns
//! races with a consumer that may still be inside `consume`.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deepsize::DeepSizeOf;
use parking_lot::Mutex;

use spool_common::config::ExecutorConfig;
use spool_common::error::{
    BoxError, ConfigError, ExecError, ExecResult, Interrupted, WorkerError, WorkerRole,
};
use spool_common::interrupt::{self, InterruptFlag};

use crate::consumer::{Consumer, ConsumerTask, Signal};
use crate::estimator::{DeepSizeEstimator, SizeEstimator};
use crate::failure::FailureSlot;
use crate::producer::{InitHook, IteratorProducer, Producer, ProducerTask, Transform};
use crate::queue::BoundedQueue;

/// How often the thread blocked in `execute()` re-checks its own interrupt
/// flag.
const CALLER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of a `BoundedExecutor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Every worker thread has been joined.
    Terminated,
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorState::Created => write!(f, "CREATED"),
            ExecutorState::Running => write!(f, "RUNNING"),
            ExecutorState::Completed => write!(f, "COMPLETED"),
            ExecutorState::Failed => write!(f, "FAILED"),
            ExecutorState::Cancelled => write!(f, "CANCELLED"),
            ExecutorState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

struct Parts<I, O, E> {
    producers: Vec<Box<dyn Producer<I>>>,
    consumer: Box<dyn Consumer<O, Output = E>>,
    transform: Transform<I, O>,
    init_hook: Option<InitHook>,
}

struct WorkerHandle {
    name: String,
    interrupt: InterruptFlag,
    handle: Option<JoinHandle<()>>,
}

/// Runs producers and a consumer over a memory-bounded queue.
pub struct BoundedExecutor<I, O, E> {
    config: ExecutorConfig,
    queue: Arc<BoundedQueue<O>>,
    failure: Arc<FailureSlot>,
    parts: Mutex<Option<Parts<I, O, E>>>,
    done_tx: Mutex<Option<Sender<Signal<E>>>>,
    done_rx: Mutex<Option<Receiver<Signal<E>>>>,
    workers: Mutex<Vec<WorkerHandle>>,
    state: Mutex<ExecutorState>,
}

impl<I, O, E> BoundedExecutor<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Single iterator source, `DeepSizeOf` sizing, default tuning.
    pub fn new<S, C, T>(
        write_buffer_limit_bytes: u64,
        source: S,
        consumer: C,
        transform: T,
        pre_execute: Option<InitHook>,
    ) -> Result<Self, ConfigError>
    where
        S: IntoIterator<Item = I>,
        S::IntoIter: Send + 'static,
        C: Consumer<O, Output = E> + 'static,
        T: Fn(I) -> Result<O, BoxError> + Send + Sync + 'static,
        O: DeepSizeOf,
    {
        let mut builder =
            ExecutorBuilder::new(ExecutorConfig::with_buffer_limit(write_buffer_limit_bytes))
                .source(source)
                .consumer(consumer)
                .transform(transform);
        if let Some(hook) = pre_execute {
            builder = builder.pre_execute_hook(hook);
        }
        builder.build()
    }

    /// Run to completion on the calling thread.
    ///
    /// Returns the consumer's result, or exactly one error:
    /// - `Aborted` if the calling thread was interrupted before or while
    ///   waiting (its flag stays raised);
    /// - `Failed` with the first worker failure;
    /// - `AlreadyStarted` on a second call.
    pub fn execute(&self) -> ExecResult<E> {
        let caller = interrupt::current();
        if caller.is_interrupted() {
            tracing::warn!("execute() called on an interrupted thread");
            spool_observability::record_execution("aborted", 0);
            return Err(ExecError::Aborted(Interrupted));
        }

        let (parts, done_tx, done_rx) = {
            let parts = self.parts.lock().take();
            let done_tx = self.done_tx.lock().take();
            let done_rx = self.done_rx.lock().take();
            match (parts, done_tx, done_rx) {
                (Some(p), Some(tx), Some(rx)) => (p, tx, rx),
                _ => return Err(ExecError::AlreadyStarted),
            }
        };

        self.set_state(ExecutorState::Running);
        let started = Instant::now();
        tracing::info!(
            producers = parts.producers.len(),
            write_buffer_limit_bytes = self.config.write_buffer_limit_bytes,
            "bounded executor starting"
        );

        if let Err(e) = self.spawn_workers(parts, done_tx) {
            tracing::error!(error = %e, "failed to spawn executor worker");
            self.shutdown_now();
            self.set_state(ExecutorState::Failed);
            return Err(ExecError::Spawn(e));
        }

        let outcome = self.wait_for_outcome(&caller, done_rx);
        let elapsed_us = started.elapsed().as_micros() as u64;
        let (state, label) = match &outcome {
            Ok(_) => (ExecutorState::Completed, "completed"),
            Err(e) if e.is_cancelled() => (ExecutorState::Cancelled, "aborted"),
            Err(_) => (ExecutorState::Failed, "failed"),
        };
        self.set_state(state);
        spool_observability::record_execution(label, elapsed_us);
        match &outcome {
            Ok(_) => tracing::info!(elapsed_us, "bounded executor completed"),
            Err(e) => tracing::warn!(elapsed_us, error = %e, "bounded executor {}", label),
        }
        outcome
    }

    fn spawn_workers(&self, parts: Parts<I, O, E>, done_tx: Sender<Signal<E>>) -> std::io::Result<()> {
        let Parts {
            producers,
            consumer,
            transform,
            init_hook,
        } = parts;
        let prefix = &self.config.thread_name_prefix;
        let mut workers = self.workers.lock();

        for (index, producer) in producers.into_iter().enumerate() {
            let name = format!("{}-producer-{}", prefix, index);
            let flag = InterruptFlag::new();
            let task = ProducerTask {
                index,
                name: name.clone(),
                producer,
                transform: Arc::clone(&transform),
                queue: Arc::clone(&self.queue),
                failure: Arc::clone(&self.failure),
                init_hook: init_hook.clone(),
                interrupt: flag.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || task.run())?;
            workers.push(WorkerHandle {
                name,
                interrupt: flag,
                handle: Some(handle),
            });
        }

        let name = format!("{}-consumer", prefix);
        let flag = InterruptFlag::new();
        let task = ConsumerTask {
            name: name.clone(),
            consumer,
            queue: Arc::clone(&self.queue),
            failure: Arc::clone(&self.failure),
            init_hook,
            interrupt: flag.clone(),
            done_tx,
        };
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || task.run())?;
        workers.push(WorkerHandle {
            name,
            interrupt: flag,
            handle: Some(handle),
        });
        Ok(())
    }

    fn wait_for_outcome(
        &self,
        caller: &InterruptFlag,
        done_rx: Receiver<Signal<E>>,
    ) -> ExecResult<E> {
        loop {
            match done_rx.recv_timeout(CALLER_POLL_INTERVAL) {
                Ok(Signal::Finished(result)) => {
                    return match self.failure.to_exec_error() {
                        Some(e) => Err(e),
                        None => Ok(result),
                    };
                }
                Ok(Signal::Failed) => return Err(self.failure_or_interrupted()),
                Err(RecvTimeoutError::Timeout) => {
                    if caller.is_interrupted() {
                        return Err(ExecError::Aborted(Interrupted));
                    }
                    if let Some(e) = self.failure.to_exec_error() {
                        return Err(e);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.failure_or_interrupted()),
            }
        }
    }

    fn failure_or_interrupted(&self) -> ExecError {
        self.failure.to_exec_error().unwrap_or_else(|| ExecError::Failed {
            role: WorkerRole::Consumer,
            source: Arc::new(WorkerError::Interrupted),
        })
    }
}

impl<I, O, E> BoundedExecutor<I, O, E> {
    /// Close the queue and interrupt every worker. Idempotent, never fails,
    /// valid before, during or after `execute()`.
    pub fn shutdown_now(&self) {
        self.queue.close();
        let interrupted = {
            let workers = self.workers.lock();
            for worker in workers.iter() {
                worker.interrupt.interrupt();
            }
            workers.len()
        };
        {
            let mut state = self.state.lock();
            if *state == ExecutorState::Running {
                *state = ExecutorState::Cancelled;
            }
        }
        tracing::debug!(workers = interrupted, "executor shutdown requested");
    }

    /// Join every worker thread. Blocks without timeout; call `shutdown_now()`
    /// first unless the run is known to be complete.
    pub fn await_termination(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.lock();
            workers
                .iter_mut()
                .filter_map(|w| w.handle.take().map(|h| (w.name.clone(), h)))
                .collect()
        };
        let joined = handles.len();
        for (name, handle) in handles {
            if handle.join().is_err() {
                tracing::error!(worker = %name, "worker thread panicked outside crash domain");
            }
        }
        let mut state = self.state.lock();
        if reaches_terminated(*state, joined) {
            *state = ExecutorState::Terminated;
        }
    }

    /// Best-effort: entries still buffered in the queue.
    pub fn is_remaining(&self) -> bool {
        self.queue.has_remaining()
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock()
    }

    pub fn queue(&self) -> &BoundedQueue<O> {
        &self.queue
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Names of worker threads started so far.
    pub fn worker_names(&self) -> Vec<String> {
        self.workers.lock().iter().map(|w| w.name.clone()).collect()
    }

    fn set_state(&self, next: ExecutorState) {
        let mut state = self.state.lock();
        if *state != ExecutorState::Terminated {
            *state = next;
        }
    }
}

/// Workers may still be starting while `Running` with nothing joined yet.
fn reaches_terminated(state: ExecutorState, joined: usize) -> bool {
    match state {
        ExecutorState::Created => false,
        ExecutorState::Running => joined > 0,
        ExecutorState::Completed
        | ExecutorState::Failed
        | ExecutorState::Cancelled
        | ExecutorState::Terminated => true,
    }
}

impl<I, O, E> Drop for BoundedExecutor<I, O, E> {
    fn drop(&mut self) {
        self.shutdown_now();
        self.await_termination();
    }
}

/// Assembles a `BoundedExecutor` from sources, a transform and a consumer.
pub struct ExecutorBuilder<I, O, E> {
    config: ExecutorConfig,
    estimator: Arc<dyn SizeEstimator<O>>,
    producers: Vec<Box<dyn Producer<I>>>,
    consumer: Option<Box<dyn Consumer<O, Output = E>>>,
    transform: Option<Transform<I, O>>,
    init_hook: Option<InitHook>,
}

impl<I, O, E> ExecutorBuilder<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Entries are sized with `DeepSizeOf`.
    pub fn new(config: ExecutorConfig) -> Self
    where
        O: DeepSizeOf,
    {
        Self::with_estimator(config, DeepSizeEstimator)
    }

    pub fn with_estimator(config: ExecutorConfig, estimator: impl SizeEstimator<O> + 'static) -> Self {
        Self {
            config,
            estimator: Arc::new(estimator),
            producers: Vec::new(),
            consumer: None,
            transform: None,
            init_hook: None,
        }
    }

    pub fn size_estimator(mut self, estimator: impl SizeEstimator<O> + 'static) -> Self {
        self.estimator = Arc::new(estimator);
        self
    }

    /// Add a pull-based producer over `source`.
    pub fn source<S>(self, source: S) -> Self
    where
        S: IntoIterator<Item = I>,
        S::IntoIter: Send + 'static,
    {
        self.producer(IteratorProducer::new(source))
    }

    /// Add a producer; each one gets its own worker thread.
    pub fn producer(mut self, producer: impl Producer<I> + 'static) -> Self {
        self.producers.push(Box::new(producer));
        self
    }

    pub fn consumer(mut self, consumer: impl Consumer<O, Output = E> + 'static) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn transform(
        mut self,
        transform: impl Fn(I) -> Result<O, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Run `hook` once on every worker thread before it starts.
    pub fn pre_execute(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.pre_execute_hook(Arc::new(hook))
    }

    pub fn pre_execute_hook(mut self, hook: InitHook) -> Self {
        self.init_hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<BoundedExecutor<I, O, E>, ConfigError> {
        self.config.validate()?;
        let consumer = self
            .consumer
            .ok_or_else(|| ConfigError::Invalid("a consumer is required".into()))?;
        let transform = self
            .transform
            .ok_or_else(|| ConfigError::Invalid("a transform is required".into()))?;

        let queue = Arc::new(BoundedQueue::new(
            &self.config,
            self.estimator,
            self.producers.len(),
        ));
        let (done_tx, done_rx) = mpsc::channel();

        // First failure: stop every worker and wake the caller.
        let failure_tx = Mutex::new(done_tx.clone());
        let failure_queue = Arc::clone(&queue);
        let failure = Arc::new(FailureSlot::with_listener(move |_| {
            failure_queue.close();
            let _ = failure_tx.lock().send(Signal::Failed);
        }));

        Ok(BoundedExecutor {
            config: self.config,
            queue,
            failure,
            parts: Mutex::new(Some(Parts {
                producers: self.producers,
                consumer,
                transform,
                init_hook: self.init_hook,
            })),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
            workers: Mutex::new(Vec::new()),
            state: Mutex::new(ExecutorState::Created),
        })
    }
}
