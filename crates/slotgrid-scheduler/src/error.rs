//! Scheduler error types.

use slot_core::{DriverError, OfferId, SlaveId, TaskId};
use thiserror::Error;

/// Errors that can occur while running a scheduling session.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The master refused the framework. Fatal to the session.
    #[error("registration failed: {0}")]
    Registration(String),

    /// A status update or registry call named a task that was never issued
    /// or is already terminal. The operation is a no-op.
    #[error("unknown or terminal task: {0}")]
    UnknownTask(TaskId),

    /// The offer could not be used. It is declined; the session continues.
    #[error("allocation failed for offer {offer_id} on slave {slave_id}: {reason}")]
    Allocation {
        offer_id: OfferId,
        slave_id: SlaveId,
        reason: String,
    },

    /// The master sent a fatal error notification.
    #[error("master error {code}: {message}")]
    Master { code: i32, message: String },

    #[error("master connection closed")]
    Disconnected,

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SchedulerError {
    /// Whether this error ends the session it was raised in.
    pub fn is_fatal(&self) -> bool {
        match self {
            SchedulerError::Registration(_)
            | SchedulerError::Master { .. }
            | SchedulerError::Disconnected
            | SchedulerError::Join(_) => true,
            SchedulerError::Driver(e) => !matches!(e, DriverError::UnknownOffer(_)),
            SchedulerError::UnknownTask(_) | SchedulerError::Allocation { .. } => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
