//! First-writer-wins failure slot shared by every worker of one execution.

use std::sync::{Arc, OnceLock};

use spool_common::error::{ExecError, WorkerError, WorkerRole};

/// The failure that `execute()` will surface.
#[derive(Debug, Clone)]
pub struct CapturedFailure {
    pub role: WorkerRole,
    pub error: Arc<WorkerError>,
}

impl CapturedFailure {
    pub fn to_exec_error(&self) -> ExecError {
        ExecError::Failed {
            role: self.role,
            source: Arc::clone(&self.error),
        }
    }
}

type Listener = Box<dyn Fn(&CapturedFailure) + Send + Sync>;

/// Single-assignment cell. Once set it never changes; later failures are
/// logged and discarded.
pub struct FailureSlot {
    cell: OnceLock<CapturedFailure>,
    listener: Option<Listener>,
}

impl FailureSlot {
    pub fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            listener: None,
        }
    }

    /// `listener` runs once, on the thread that wins the slot.
    pub fn with_listener(listener: impl Fn(&CapturedFailure) + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            listener: Some(Box::new(listener)),
        }
    }

    /// Record `error`. Returns true if this call set the slot.
    pub fn record(&self, role: WorkerRole, error: WorkerError) -> bool {
        let captured = CapturedFailure {
            role,
            error: Arc::new(error),
        };
        match self.cell.set(captured) {
            Ok(()) => {
                if let Some(first) = self.cell.get() {
                    tracing::warn!(worker = %role, error = %first.error, "worker failed");
                    if let Some(listener) = &self.listener {
                        listener(first);
                    }
                }
                true
            }
            Err(discarded) => {
                tracing::debug!(
                    worker = %role,
                    error = %discarded.error,
                    "discarding failure, slot already set"
                );
                false
            }
        }
    }

    pub fn get(&self) -> Option<&CapturedFailure> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn to_exec_error(&self) -> Option<ExecError> {
        self.get().map(CapturedFailure::to_exec_error)
    }
}

impl Default for FailureSlot {
    fn default() -> Self {
        Self::new()
    }
}
