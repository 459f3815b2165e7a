//! Offer allocator: binds pending task specs to resource offers.
//!
//! Policy is greedy and FIFO: each offer receives at most one task, taken
//! from the front of the pending queue. No reordering, no priorities.
//! An offer that cannot hold the next spec is declined and the spec stays
//! queued for a later offer.

use std::collections::VecDeque;

use tracing::{debug, warn};

use slot_core::{Offer, OfferId, TaskDescription, TaskSpec, Todo};

use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::TaskRegistry;

/// Specs waiting for an offer.
///
/// Bounded queues drain; an unbounded queue falls back to cloning its
/// template once the explicit specs run out, so it never empties.
#[derive(Debug, Clone, Default)]
pub struct PendingTasks {
    queue: VecDeque<TaskSpec>,
    repeat: Option<TaskSpec>,
}

impl PendingTasks {
    /// A finite queue in submission order.
    pub fn bounded(specs: impl IntoIterator<Item = TaskSpec>) -> Self {
        Self {
            queue: specs.into_iter().collect(),
            repeat: None,
        }
    }

    /// An endless supply of copies of `template`.
    pub fn unbounded(template: TaskSpec) -> Self {
        Self {
            queue: VecDeque::new(),
            repeat: Some(template),
        }
    }

    /// `todo` copies of `template`, or an endless supply for `Unbounded`.
    pub fn from_todo(todo: Todo, template: TaskSpec) -> Self {
        match todo {
            Todo::Bounded(n) => Self::bounded((0..n).map(|_| template.clone())),
            Todo::Unbounded => Self::unbounded(template),
        }
    }

    pub fn peek(&self) -> Option<&TaskSpec> {
        self.queue.front().or(self.repeat.as_ref())
    }

    pub fn pop(&mut self) -> Option<TaskSpec> {
        self.queue.pop_front().or_else(|| self.repeat.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.repeat.is_none()
    }

    pub fn is_unbounded(&self) -> bool {
        self.repeat.is_some()
    }

    /// Specs left in a bounded queue; `None` when unbounded.
    pub fn remaining(&self) -> Option<usize> {
        match self.repeat {
            Some(_) => None,
            None => Some(self.queue.len()),
        }
    }
}

/// Greedy one-task-per-offer placement.
#[derive(Debug, Clone, Default)]
pub struct OfferAllocator;

impl OfferAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Place pending work on `offer`.
    ///
    /// Returns the task descriptions to send back with the offer reply;
    /// whatever was not placed stays in `pending`. An empty result is a
    /// decline, not an error. Malformed offers fail with `Allocation` and
    /// leave `pending` and the registry untouched.
    pub fn allocate(
        &self,
        offer_id: &OfferId,
        offer: &Offer,
        pending: &mut PendingTasks,
        registry: &TaskRegistry,
    ) -> SchedulerResult<Vec<TaskDescription>> {
        validate_offer(offer_id, offer)?;

        let Some(next) = pending.peek() else {
            debug!(%offer_id, slave = %offer.slave_id, "nothing pending, declining offer");
            return Ok(Vec::new());
        };

        if !offer.resources.covers(&next.resources) {
            warn!(
                %offer_id,
                slave = %offer.slave_id,
                offered_cpus = offer.resources.cpus,
                offered_mem = offer.resources.mem_bytes,
                required_cpus = next.resources.cpus,
                required_mem = next.resources.mem_bytes,
                "offer too small for next task, declining"
            );
            return Ok(Vec::new());
        }

        let Some(spec) = pending.pop() else {
            return Ok(Vec::new());
        };
        let task_id = registry.next_task_id();
        registry.record_launched(task_id, &offer.slave_id)?;

        debug!(%offer_id, slave = %offer.slave_id, %task_id, "placed task");

        Ok(vec![TaskDescription {
            task_id,
            slave_id: offer.slave_id.clone(),
            name: format!("{}:{}", spec.name, task_id),
            resources: spec.resources,
            params: offer.params.clone(),
            payload: spec.payload,
        }])
    }
}

fn validate_offer(offer_id: &OfferId, offer: &Offer) -> SchedulerResult<()> {
    let reason = if offer.slave_id.as_str().is_empty() {
        Some("offer has no slave id")
    } else if !offer.resources.cpus.is_finite() || offer.resources.cpus < 0.0 {
        Some("offer has an invalid cpu amount")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SchedulerError::Allocation {
            offer_id: offer_id.clone(),
            slave_id: offer.slave_id.clone(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
