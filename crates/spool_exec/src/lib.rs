//! Memory-bounded producer/consumer executor.
//!
//! Producers push transformed entries into a `BoundedQueue` whose record
//! capacity is derived from a byte budget and sampled entry sizes; a single
//! consumer drains it. `BoundedExecutor` owns the worker threads and the
//! shutdown protocol.

pub mod consumer;
pub mod estimator;
pub mod executor;
pub mod failure;
pub mod producer;
pub mod queue;


pub use consumer::Consumer;
pub use estimator::{DeepSizeEstimator, FnEstimator, SizeEstimator};
pub use executor::{BoundedExecutor, ExecutorBuilder, ExecutorState};
pub use failure::{CapturedFailure, FailureSlot};
pub use producer::{
    FallibleIteratorProducer, FnProducer, Halt, InitHook, IteratorProducer, Producer, RecordSink,
    Transform,
};
pub use queue::{BoundedQueue, QueueState};
pub use spool_common::error::{ExecError, WorkerError, WorkerRole};
