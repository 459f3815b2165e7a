//! slotgrid-executor: runs tasks on a slave on behalf of a framework.
//!
//! The runtime receives launch/kill/shutdown events from the master,
//! turns each task's payload into a [`Workload`] and reports status
//! updates back through an [`ExecutorDriver`](slot_core::ExecutorDriver).
//!
//! # Architecture
//!
//! ```text
//! ExecutorRuntime (one per framework per slave)
//!   ├── WorkloadFactory (payload → Workload)
//!   │     ├── SleepWorkloadFactory   ("sleep")
//!   │     └── NestedWorkloadFactory  ("scaling")
//!   │           └── NestedSessionManager → child SchedulerCore
//!   └── active tasks (kill signal + worker handle)
//! ```

pub mod error;
pub mod nested;
pub mod runtime;
pub mod workload;

pub use error::{ExecutorError, ExecutorResult};
pub use nested::{ChildSession, NestedSessionManager, NestedWorkload, NestedWorkloadFactory};
pub use runtime::ExecutorRuntime;
pub use workload::{
    BoxFuture, KillSignal, SleepWorkload, SleepWorkloadFactory, TaskOutcome, Workload,
    WorkloadFactory,
};

/// Executor uri of the built-in sleep executor.
pub const SLEEP_EXECUTOR: &str = "sleep";

/// Executor uri of the built-in nested-session executor.
pub const SCALING_EXECUTOR: &str = "scaling";
