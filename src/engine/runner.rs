//! Dispatch of schedule batches onto an async runtime.

use std::future::Future;
use std::pin::Pin;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{CalibResult, ExecutionError};
use crate::orchestrator::BatchOutcome;

/// One batch of work, ready to be spawned.
pub type UnitFuture = Pin<Box<dyn Future<Output = BatchOutcome> + Send + 'static>>;

/// Submits batch units for concurrent execution.
pub trait TaskRunner: Send + Sync {
    fn submit(&self, unit: UnitFuture) -> UnitHandle;
}

/// Handle to a submitted unit.
#[derive(Debug)]
pub struct UnitHandle {
    join: JoinHandle<BatchOutcome>,
}

impl UnitHandle {
    pub fn new(join: JoinHandle<BatchOutcome>) -> Self {
        Self { join }
    }

    pub fn cancel(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the unit. A panic or cancellation becomes `ExecutionError::Aborted`.
    pub async fn wait(self) -> CalibResult<BatchOutcome> {
        self.join.await.map_err(|e| {
            let message = if e.is_cancelled() {
                "unit was cancelled".to_string()
            } else {
                format!("unit panicked: {e}")
            };
            ExecutionError::Aborted { message }.into()
        })
    }
}

/// Spawns units on the ambient runtime, or on a given one.
#[derive(Debug, Clone, Default)]
pub struct TokioTaskRunner {
    handle: Option<Handle>,
}

impl TokioTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self { handle: Some(handle) }
    }
}

impl TaskRunner for TokioTaskRunner {
    fn submit(&self, unit: UnitFuture) -> UnitHandle {
        let join = match &self.handle {
            Some(handle) => handle.spawn(unit),
            None => tokio::spawn(unit),
        };
        UnitHandle::new(join)
    }
}
