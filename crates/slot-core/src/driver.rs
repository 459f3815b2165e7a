//! The boundary between a scheduling core and the cluster master.
//!
//! Inbound traffic is modelled as event enums delivered over tokio
//! channels; outbound calls go through the driver traits. Both sides are
//! injected at construction so the core never reaches for a global.
//!
//! ```text
//!            SchedulerEvent              ExecutorEvent
//!   master ───────────────▶ scheduler    master ─────────────▶ executor
//!   master ◀─────────────── scheduler    master ◀───────────── executor
//!            SchedulerDriver             ExecutorDriver
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{
    FrameworkId, FrameworkInfo, Offer, OfferId, SlaveId, TaskDescription, TaskId, TaskStatus,
};

/// Metadata key carrying how long the master should withhold declined
/// resources from this framework.
pub const REFUSE_SECONDS: &str = "refuse_seconds";

/// Errors surfaced by a driver. None of them are retried by the core.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no master at address: {0}")]
    UnknownMaster(String),

    #[error("unknown offer: {0}")]
    UnknownOffer(OfferId),

    #[error("framework not registered: {0}")]
    NotRegistered(FrameworkId),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("driver disconnected")]
    Disconnected,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Events a master delivers to a scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Registered(FrameworkId),
    ResourceOffer {
        offer_id: OfferId,
        offers: Vec<Offer>,
    },
    OfferRescinded(OfferId),
    StatusUpdate(TaskStatus),
    SlaveLost(SlaveId),
    /// Fatal notification from the master.
    Error { code: i32, message: String },
}

/// Events a master delivers to an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Launch(TaskDescription),
    Kill(TaskId),
    Shutdown,
    Error { code: i32, message: String },
}

/// Calls a scheduler makes towards its master.
pub trait SchedulerDriver: Send + Sync {
    /// Accept an offer with `tasks`, or decline it by passing none.
    fn reply_to_offer(
        &self,
        offer_id: &OfferId,
        tasks: Vec<TaskDescription>,
        params: HashMap<String, String>,
    ) -> DriverResult<()>;

    fn kill_task(&self, task_id: TaskId) -> DriverResult<()>;

    /// Unregister the framework. Further calls fail with `NotRegistered`.
    fn stop(&self) -> DriverResult<()>;
}

/// Calls an executor makes towards its master.
pub trait ExecutorDriver: Send + Sync {
    fn send_status_update(&self, status: TaskStatus) -> DriverResult<()>;
}

/// A live registration with a master.
pub struct Connection {
    pub driver: Arc<dyn SchedulerDriver>,
    pub events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

/// Resolves a master address into a framework registration.
///
/// The `Registered` event (or an `Error` on rejection) arrives on the
/// returned event channel, not as the return value.
pub trait MasterConnector: Send + Sync {
    fn connect(&self, address: &str, framework: FrameworkInfo) -> DriverResult<Connection>;
}
