// Per-task execution and batch dispatch

pub mod context;
pub mod executor;
pub mod runner;

pub use context::ExecutionContext;
pub use executor::{NO_RUN_RESULT, TaskExecutionResult, TaskExecutor};
pub use runner::{TaskRunner, TokioTaskRunner, UnitFuture, UnitHandle};
