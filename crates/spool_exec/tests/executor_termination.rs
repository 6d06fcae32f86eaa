//! Shutdown ordering against a consumer that owns a non-thread-safe resource.
//!
//! The consumer holds a lock while writing each entry. The harness "closes"
//! the same resource by taking that lock. Closing before the executor is
//! shut down and joined races with a consumer still inside `consume`;
//! closing afterwards never does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;

use spool_common::error::BoxError;
use spool_common::interrupt;
use spool_exec::{BoundedExecutor, Consumer, ExecError};

const WRITE_BUFFER_LIMIT: u64 = 1024 * 1024;

#[derive(Clone, Default)]
struct SharedWriter {
    lock: Arc<Mutex<()>>,
    found_concurrent_usage: Arc<AtomicBool>,
}

impl SharedWriter {
    /// Hold the writer for `hold`; flags contention if someone else has it.
    fn use_for(&self, hold: Duration) {
        match self.lock.try_lock() {
            Some(_guard) => std::thread::sleep(hold),
            None => self.found_concurrent_usage.store(true, Ordering::SeqCst),
        }
    }

    fn close(&self, hold: Duration) {
        self.use_for(hold);
    }

    fn found_concurrent_usage(&self) -> bool {
        self.found_concurrent_usage.load(Ordering::SeqCst)
    }
}

struct NonThreadSafeConsumer {
    writer: SharedWriter,
    written: u64,
}

impl Consumer<u64> for NonThreadSafeConsumer {
    type Output = u64;

    fn consume(&mut self, _entry: u64) -> Result<(), BoxError> {
        self.writer.use_for(Duration::from_millis(10));
        self.written += 1;
        Ok(())
    }

    fn result(&mut self) -> u64 {
        self.written
    }
}

/// Runs an endless ingest on a dedicated thread, interrupts that thread
/// mid-run, and reports whether the consumer's writer was ever used
/// concurrently.
fn run_ingest(shutdown_before_close: bool) -> bool {
    let (flag_tx, flag_rx) = mpsc::channel();
    let harness = std::thread::spawn(move || {
        let _ = flag_tx.send(interrupt::current());
        let writer = SharedWriter::default();
        let consumer = NonThreadSafeConsumer {
            writer: writer.clone(),
            written: 0,
        };
        let exec = BoundedExecutor::new(WRITE_BUFFER_LIMIT, 0u64.., consumer, |r: u64| Ok(r), None)
            .unwrap();

        let outcome = exec.execute();
        assert!(matches!(outcome, Err(ExecError::Aborted(_))));
        assert!(interrupt::is_interrupted());

        if shutdown_before_close {
            exec.shutdown_now();
            exec.await_termination();
            writer.close(Duration::from_millis(500));
        } else {
            writer.close(Duration::from_millis(500));
            exec.shutdown_now();
            exec.await_termination();
        }
        writer.found_concurrent_usage()
    });

    let flag = flag_rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(500));
    flag.interrupt();
    harness.join().unwrap()
}

#[test]
fn test_close_before_termination_races_with_consumer() {
    assert!(run_ingest(false));
}

#[test]
fn test_close_after_termination_is_exclusive() {
    assert!(!run_ingest(true));
}

#[test]
fn test_hundred_records_complete() {
    #[derive(Default)]
    struct Count(u64);

    impl Consumer<u64> for Count {
        type Output = u64;

        fn consume(&mut self, _entry: u64) -> Result<(), BoxError> {
            self.0 += 1;
            Ok(())
        }

        fn result(&mut self) -> u64 {
            self.0
        }
    }

    let exec =
        BoundedExecutor::new(1024, 0..100u64, Count::default(), |r: u64| Ok(r * 3), None).unwrap();
    assert_eq!(exec.execute().unwrap(), 100);
    assert!(!exec.is_remaining());
    exec.shutdown_now();
    exec.await_termination();
}
