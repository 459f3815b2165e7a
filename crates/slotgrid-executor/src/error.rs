//! Executor error types.

use slot_core::codec::CodecError;
use slot_core::DriverError;
use slotgrid_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid task payload: {0}")]
    Payload(#[from] CodecError),

    #[error("cannot reach master {master}: {source}")]
    Connect {
        master: String,
        #[source]
        source: DriverError,
    },

    /// A nested session ended in error. Reported as the parent task's
    /// FAILED status; the parent session itself carries on.
    #[error("nested session on {master} failed: {source}")]
    NestedSession {
        master: String,
        #[source]
        source: SchedulerError,
    },

    /// Child tasks asked for the scaling executor with no level below
    /// them to run.
    #[error("nested sessions on {master} use the scaling executor but have no next level")]
    MissingNextLevel { master: String },

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
