use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by caller-supplied callbacks (sources, transforms,
/// consumers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for `Result<T, ExecError>`.
pub type ExecResult<T> = Result<T, ExecError>;

/// Error classification for callers deciding whether to retry a write.
///
/// - `Cancelled`   — the caller or a shutdown interrupted execution
/// - `Callback`    — a source, transform or consumer callback failed
/// - `Misuse`      — the executor was driven outside its lifecycle
/// - `InternalBug` — a worker panicked or could not be spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancelled,
    Callback,
    Misuse,
    InternalBug,
}

/// Returned by [`crate::interrupt::sleep`] and friends when the current
/// thread's interrupt flag is raised.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("thread interrupted")]
pub struct Interrupted;

/// Which worker a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// Producer worker, numbered in registration order.
    Producer(usize),
    Consumer,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Producer(idx) => write!(f, "producer-{}", idx),
            WorkerRole::Consumer => write!(f, "consumer"),
        }
    }
}

/// Bounded queue errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Insertion after the queue was closed or finished. Expected while
    /// shutting down; never surfaced to the executor's caller.
    #[error("Queue closed")]
    Closed,
}

/// A failure captured on a worker thread.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("source failed: {0}")]
    Source(#[source] BoxError),

    #[error("transform failed: {0}")]
    Transform(#[source] BoxError),

    #[error("consumer failed on record: {0}")]
    Consume(#[source] BoxError),

    #[error("consumer failed to finish: {0}")]
    Finish(#[source] BoxError),

    #[error("panic in stage '{stage}': {message}")]
    Panicked { stage: &'static str, message: String },

    /// The queue was closed underneath the consumer before every producer
    /// finished.
    #[error("worker interrupted before the queue drained")]
    Interrupted,
}

/// Errors surfaced by `BoundedExecutor::execute()`.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The calling thread was interrupted before or while waiting. The
    /// interrupt flag is left raised.
    #[error("Execution aborted: calling thread interrupted")]
    Aborted(#[source] Interrupted),

    /// The first failure captured from any worker.
    #[error("Execution failed in {role}: {source}")]
    Failed {
        role: WorkerRole,
        #[source]
        source: Arc<WorkerError>,
    },

    #[error("Executor already started")]
    AlreadyStarted,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Aborted(_) => ErrorKind::Cancelled,
            ExecError::Failed { source, .. } => match source.as_ref() {
                WorkerError::Interrupted => ErrorKind::Cancelled,
                WorkerError::Panicked { .. } => ErrorKind::InternalBug,
                _ => ErrorKind::Callback,
            },
            ExecError::AlreadyStarted => ErrorKind::Misuse,
            ExecError::Spawn(_) => ErrorKind::InternalBug,
        }
    }

    /// The captured worker failure, if this is `Failed`.
    pub fn worker_error(&self) -> Option<&WorkerError> {
        match self {
            ExecError::Failed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// True if the caller or a shutdown cancelled execution.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(err: WorkerError) -> ExecError {
        ExecError::Failed {
            role: WorkerRole::Producer(0),
            source: Arc::new(err),
        }
    }

    #[test]
    fn test_aborted_is_cancelled() {
        let err = ExecError::Aborted(Interrupted);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.is_cancelled());
        assert!(err.worker_error().is_none());
    }

    #[test]
    fn test_interrupted_worker_is_cancelled() {
        assert!(failed(WorkerError::Interrupted).is_cancelled());
    }

    #[test]
    fn test_callback_failures() {
        let err = failed(WorkerError::Transform("bad row".into()));
        assert_eq!(err.kind(), ErrorKind::Callback);
        assert!(matches!(err.worker_error(), Some(WorkerError::Transform(_))));
    }

    #[test]
    fn test_panic_is_internal_bug() {
        let err = failed(WorkerError::Panicked {
            stage: "transform",
            message: "boom".into(),
        });
        assert_eq!(err.kind(), ErrorKind::InternalBug);
    }

    #[test]
    fn test_already_started_is_misuse() {
        assert_eq!(ExecError::AlreadyStarted.kind(), ErrorKind::Misuse);
    }

    #[test]
    fn test_failed_message_names_role() {
        let err = ExecError::Failed {
            role: WorkerRole::Consumer,
            source: Arc::new(WorkerError::Consume("disk full".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("consumer"), "{}", msg);
        assert!(msg.contains("disk full"), "{}", msg);
    }

    #[test]
    fn test_failed_source_chain() {
        use std::error::Error as _;
        let err = failed(WorkerError::Source("eof".into()));
        let src = err.source().expect("source");
        assert!(src.to_string().contains("eof"));
    }

    #[test]
    fn test_worker_role_display() {
        assert_eq!(WorkerRole::Producer(3).to_string(), "producer-3");
        assert_eq!(WorkerRole::Consumer.to_string(), "consumer");
    }
}
