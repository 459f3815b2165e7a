//! slotgrid-scheduler: the framework side of a resource-offer cycle.
//!
//! A scheduling session registers with a master, answers resource offers
//! with task assignments, and folds status updates back in until its task
//! count is reached or it is stopped.
//!
//! # Architecture
//!
//! ```text
//! SchedulerCore (one per session, single task)
//!   ├── SchedulerDriver (reply / kill / stop towards the master)
//!   ├── OfferAllocator (greedy, one task per offer, FIFO)
//!   │     └── PendingTasks (bounded queue or unbounded template)
//!   └── TaskRegistry (ids from 0, lifecycle, finished/failed counts)
//! ```

pub mod allocator;
pub mod error;
pub mod registry;
pub mod scheduler;

pub use allocator::{OfferAllocator, PendingTasks};
pub use error::{SchedulerError, SchedulerResult};
pub use registry::TaskRegistry;
pub use scheduler::{
    SchedulerCore, SessionHandle, SessionReport, SessionState, StopHandle, TerminationReason,
};
