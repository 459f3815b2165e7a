//! Task registry: task identity, lifecycle state, and completion counts.
//!
//! One registry per scheduling session. All state lives behind a single
//! mutex so that bumping a counter and marking a task terminal commit
//! together: a failed call leaves both untouched.
//!
//! Only tasks still in flight keep a record. Ids are issued densely, so an
//! issued id with no record is one that reached a terminal state, and an
//! unbounded session holds memory for its in-flight tasks only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use slot_core::{SlaveId, TaskId, TaskState};

use crate::error::{SchedulerError, SchedulerResult};

/// An issued task that has not reached a terminal state.
#[derive(Debug, Clone)]
struct TaskRecord {
    slave_id: Option<SlaveId>,
    state: TaskState,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    tasks: HashMap<TaskId, TaskRecord>,
    finished: u64,
    failed: u64,
}

impl Inner {
    fn issued(&self, task_id: TaskId) -> bool {
        task_id.0 < self.next_id
    }
}

/// Issues task ids and tracks their lifecycle for one session.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next task id. Ids start at 0 and are never reused.
    pub fn next_task_id(&self) -> TaskId {
        let mut inner = self.lock();
        let id = TaskId(inner.next_id);
        inner.next_id += 1;
        inner.tasks.insert(
            id,
            TaskRecord {
                slave_id: None,
                state: TaskState::Staging,
            },
        );
        id
    }

    /// Remember which slave an issued task was placed on.
    pub fn record_launched(&self, task_id: TaskId, slave_id: &SlaveId) -> SchedulerResult<()> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&task_id) {
            Some(record) => {
                record.slave_id = Some(slave_id.clone());
                Ok(())
            }
            None => Err(SchedulerError::UnknownTask(task_id)),
        }
    }

    /// Mark a task FINISHED and count it.
    pub fn record_finished(&self, task_id: TaskId) -> SchedulerResult<()> {
        self.record_terminal(task_id, TaskState::Finished)
    }

    /// Move a task into a terminal state and forget its record.
    ///
    /// FINISHED bumps the finished counter, FAILED and LOST bump the
    /// failure counter. Fails with `UnknownTask` if the id was never
    /// issued or is already terminal.
    pub fn record_terminal(&self, task_id: TaskId, state: TaskState) -> SchedulerResult<()> {
        debug_assert!(state.is_terminal());
        let mut inner = self.lock();
        if inner.tasks.remove(&task_id).is_none() {
            return Err(SchedulerError::UnknownTask(task_id));
        }
        if state == TaskState::Finished {
            inner.finished += 1;
        } else if state.is_failure() {
            inner.failed += 1;
        }
        Ok(())
    }

    /// Record a non-terminal transition (STAGING → RUNNING).
    pub fn record_running(&self, task_id: TaskId) -> SchedulerResult<()> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&task_id) {
            Some(record) => {
                record.state = TaskState::Running;
                Ok(())
            }
            None => Err(SchedulerError::UnknownTask(task_id)),
        }
    }

    /// Whether a task has reached a terminal state. Unknown ids are not terminal.
    pub fn is_terminal(&self, task_id: TaskId) -> bool {
        let inner = self.lock();
        inner.issued(task_id) && !inner.tasks.contains_key(&task_id)
    }

    /// State of a task still in flight. Terminal and unknown ids have none.
    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.lock().tasks.get(&task_id).map(|r| r.state)
    }

    /// Ids of every issued task that has not reached a terminal state.
    pub fn active(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.lock().tasks.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Active tasks placed on `slave_id`.
    pub fn on_slave(&self, slave_id: &SlaveId) -> Vec<TaskId> {
        let inner = self.lock();
        let mut ids: Vec<TaskId> = inner
            .tasks
            .iter()
            .filter(|(_, r)| r.slave_id.as_ref() == Some(slave_id))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of task records held, one per task in flight.
    pub fn tracked(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.lock().next_id
    }

    pub fn finished(&self) -> u64 {
        self.lock().finished
    }

    pub fn failed(&self) -> u64 {
        self.lock().failed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
