//! Crash domain isolation for worker threads.
//!
//! User callbacks run on engine-owned threads. A panic inside one must not
//! unwind past the worker boundary: `catch_stage` converts it into
//! `WorkerError::Panicked` so the worker can record it like any other
//! failure and still run its cleanup.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::WorkerError;

static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of worker panics captured by this process.
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Run `f`, converting a panic into `WorkerError::Panicked`.
///
/// - `stage`: short label for the callback (e.g. `"transform"`)
/// - `worker`: worker name injected into the log line
pub fn catch_stage<T, F>(stage: &'static str, worker: &str, f: F) -> Result<T, WorkerError>
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            PANIC_COUNT.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                stage = stage,
                worker = worker,
                panic_message = %message,
                "worker panic caught by crash domain"
            );
            Err(WorkerError::Panicked { stage, message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_stage_ok() {
        let r = catch_stage("transform", "producer-0", || 42);
        assert_eq!(r.unwrap(), 42);
    }

    #[test]
    fn test_catch_stage_str_panic() {
        let before = panic_count();
        let r: Result<(), _> = catch_stage("consume", "consumer", || panic!("boom"));
        match r {
            Err(WorkerError::Panicked { stage, message }) => {
                assert_eq!(stage, "consume");
                assert_eq!(message, "boom");
            }
            other => panic!("expected Panicked, got {:?}", other),
        }
        assert!(panic_count() > before);
    }

    #[test]
    fn test_catch_stage_string_panic() {
        let r: Result<(), _> = catch_stage("source", "producer-1", || {
            panic!("{}", format!("row {}", 7))
        });
        match r {
            Err(WorkerError::Panicked { message, .. }) => assert_eq!(message, "row 7"),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn test_non_string_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }
}
