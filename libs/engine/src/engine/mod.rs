//! Engine core
//!
//! Instance registry and locks, the execution loop, scheduler pools, the
//! retry queue, periodic cleanup, the operation-authority gate, and
//! export/import.

pub mod authority;
pub mod builder;
pub mod core;
pub mod export;
pub mod pool;
pub mod retry;
pub mod runner;

pub use authority::{allowed_operations, is_allowed};
pub use builder::WorkflowEngineBuilder;
pub use export::{ExportedBundle, EXPORT_VERSION};
pub use pool::WorkerPool;
pub use retry::{RetryPolicy, RetryQueue, ScheduledRetry};
pub use self::core::{
    BatchFailure, BatchOperationResult, BatchSkip, GroupMembership, NoGroups, WorkflowEngine,
};
