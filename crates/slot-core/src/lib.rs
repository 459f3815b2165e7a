//! slot-core: shared vocabulary for SlotGrid.
//!
//! Identifiers and the task/offer data model, the driver boundary between
//! a scheduling core and a cluster master, the payload codec used by the
//! built-in executors, and `slotd.toml` parsing.

pub mod codec;
pub mod config;
pub mod driver;
pub mod types;

pub use config::{ExecutionMode, SlotConfig};
pub use driver::{
    Connection, DriverError, DriverResult, ExecutorDriver, ExecutorEvent, MasterConnector,
    SchedulerDriver, SchedulerEvent,
};
pub use types::*;
