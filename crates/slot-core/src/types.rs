//! Shared types used across SlotGrid crates.
//!
//! Identifiers are newtypes so a `TaskId` can never be passed where an
//! `OfferId` is expected. Everything here is plain data: `Clone`,
//! serializable, and free of behaviour beyond small accessors.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Identifiers ───────────────────────────────────────────────────

/// Identifier assigned to a framework by the master at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameworkId(pub String);

/// Identifier of a task within one scheduling session.
///
/// Issued from 0 upwards by the session's task registry. Only unique
/// within a single `FrameworkId`; see [`QualifiedTaskId`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

/// Identifier of a resource offer, scoped to the master that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferId(pub String);

/// Identifier of a slave (worker node) known to a master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlaveId(pub String);

/// A task id together with the framework that issued it.
///
/// Nested sessions restart their task counter at 0, so only the
/// qualified form is unique across a session tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedTaskId {
    pub framework_id: FrameworkId,
    pub task_id: TaskId,
}

impl FrameworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl OfferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl SlaveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl QualifiedTaskId {
    pub fn new(framework_id: FrameworkId, task_id: TaskId) -> Self {
        Self {
            framework_id,
            task_id,
        }
    }
}

impl fmt::Display for FrameworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for QualifiedTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.framework_id, self.task_id)
    }
}

// ── Resources & offers ────────────────────────────────────────────

/// Scalar resources offered by a slave or required by a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem_bytes: u64,
}

impl Resources {
    pub fn new(cpus: f64, mem_bytes: u64) -> Self {
        Self { cpus, mem_bytes }
    }

    /// Whether `self` is large enough to hold `required`.
    pub fn covers(&self, required: &Resources) -> bool {
        self.cpus >= required.cpus && self.mem_bytes >= required.mem_bytes
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem_bytes: 128 * 1024 * 1024,
        }
    }
}

/// A slot of resources on one slave, open for a single scheduling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub slave_id: SlaveId,
    pub resources: Resources,
    /// Free-form parameters reported by the master for this slave.
    pub params: HashMap<String, String>,
}

// ── Tasks ─────────────────────────────────────────────────────────

/// Work waiting to be scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub resources: Resources,
    /// Opaque payload handed to the executor.
    pub payload: Vec<u8>,
}

/// A task spec bound to a slave, ready to hand to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub task_id: TaskId,
    pub slave_id: SlaveId,
    pub name: String,
    pub resources: Resources,
    /// Offer parameters the task was placed with.
    pub params: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    /// Terminal states admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// Terminal states that count as a failure of the task.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Lost)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A status update for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: String,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

// ── Framework ─────────────────────────────────────────────────────

/// Which executor the master starts on a slave for this framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Executor kind, resolved by the master's executor registry.
    pub uri: String,
}

impl ExecutorInfo {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// Registration details a framework presents to a master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    pub executor: ExecutorInfo,
}

// ── Todo ──────────────────────────────────────────────────────────

/// How many tasks a session should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Todo {
    Bounded(u64),
    /// Schedule one task per offer forever; encoded as `-1`.
    Unbounded,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid todo count {0}: expected -1 or a non-negative number")]
pub struct InvalidTodo(pub i64);

impl Todo {
    pub fn bound(self) -> Option<u64> {
        match self {
            Todo::Bounded(n) => Some(n),
            Todo::Unbounded => None,
        }
    }
}

impl TryFrom<i64> for Todo {
    type Error = InvalidTodo;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Todo::Unbounded),
            n if n >= 0 => Ok(Todo::Bounded(n as u64)),
            n => Err(InvalidTodo(n)),
        }
    }
}

impl From<Todo> for i64 {
    fn from(todo: Todo) -> Self {
        match todo {
            // Counts past i64::MAX saturate rather than wrap into the sentinel.
            Todo::Bounded(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Todo::Unbounded => -1,
        }
    }
}

impl fmt::Display for Todo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Todo::Bounded(n) => write!(f, "{n}"),
            Todo::Unbounded => f.write_str("unbounded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Staging.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Killed.is_terminal());
        assert!(TaskState::Lost.is_terminal());
    }

    #[test]
    fn only_failed_and_lost_are_failures() {
        assert!(TaskState::Failed.is_failure());
        assert!(TaskState::Lost.is_failure());
        assert!(!TaskState::Killed.is_failure());
        assert!(!TaskState::Finished.is_failure());
    }

    #[test]
    fn todo_sentinel() {
        assert_eq!(Todo::try_from(-1), Ok(Todo::Unbounded));
        assert_eq!(Todo::try_from(0), Ok(Todo::Bounded(0)));
        assert_eq!(Todo::try_from(5), Ok(Todo::Bounded(5)));
        assert_eq!(Todo::try_from(-2), Err(InvalidTodo(-2)));
        assert_eq!(i64::from(Todo::Unbounded), -1);
    }

    #[test]
    fn todo_serde_uses_sentinel() {
        let json = serde_json::to_string(&Todo::Unbounded).unwrap();
        assert_eq!(json, "-1");
        let parsed: Todo = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Todo::Bounded(3));
        assert!(serde_json::from_str::<Todo>("-7").is_err());
    }

    #[test]
    fn huge_bounded_todo_saturates() {
        assert_eq!(i64::from(Todo::Bounded(u64::MAX)), i64::MAX);
        assert_eq!(i64::from(Todo::Bounded(1 << 63)), i64::MAX);
        let json = serde_json::to_string(&Todo::Bounded(u64::MAX)).unwrap();
        assert_eq!(json, i64::MAX.to_string());
    }

    #[test]
    fn qualified_ids_render_framework_and_task() {
        let q = QualifiedTaskId::new(FrameworkId::new("local-1"), TaskId(4));
        assert_eq!(q.to_string(), "local-1:4");
    }

    #[test]
    fn resources_cover() {
        let offer = Resources::new(2.0, 1024);
        assert!(offer.covers(&Resources::new(1.0, 512)));
        assert!(offer.covers(&Resources::new(2.0, 1024)));
        assert!(!offer.covers(&Resources::new(2.5, 512)));
        assert!(!offer.covers(&Resources::new(1.0, 2048)));
    }
}
