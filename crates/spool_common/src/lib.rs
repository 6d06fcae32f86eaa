pub mod config;
pub mod crash_domain;
pub mod error;
pub mod interrupt;

pub use error::{BoxError, ExecError, ExecResult, QueueError, WorkerError, WorkerRole};
