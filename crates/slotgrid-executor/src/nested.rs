//! Nested scheduling sessions.
//!
//! A nested workload turns its executor into a framework of its own: it
//! registers with another master and runs a fresh [`SchedulerCore`] there
//! until that child session's todo is met. The parent task finishes only
//! once the child has.
//!
//! ```text
//! parent session ──launch──▶ ExecutorRuntime
//!                               └── NestedWorkload
//!                                     └── NestedSessionManager
//!                                           └── child SchedulerCore ──▶ other master
//! ```
//!
//! Child sessions get their own framework id from the master they join, so
//! their task ids never collide with the parent's.
//!
//! A [`NestedPayload`] with a `next` level makes the child's tasks scaling
//! tasks too, so sessions form a tree one master per level.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use slot_core::codec::{self, NestedPayload, SleepPayload};
use slot_core::{
    ExecutorInfo, FrameworkInfo, MasterConnector, Resources, TaskDescription, TaskSpec, Todo,
};
use slotgrid_scheduler::{SchedulerCore, SchedulerError, SessionReport, StopHandle};

use crate::error::{ExecutorError, ExecutorResult};
use crate::workload::{BoxFuture, KillSignal, TaskOutcome, Workload, WorkloadFactory};
use crate::SCALING_EXECUTOR;

/// Executor uri nested sessions ask the master to start by default.
pub const DEFAULT_NESTED_EXECUTOR: &str = "sleep";

struct ChildSlot {
    master: String,
    stop: StopHandle,
    /// Flips to `true` once the child session has fully torn down.
    done: watch::Receiver<bool>,
}

/// A live child session, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSession {
    pub id: u64,
    pub master: String,
}

/// Starts and cancels child scheduling sessions.
pub struct NestedSessionManager {
    connector: Arc<dyn MasterConnector>,
    executor_uri: String,
    task_resources: Resources,
    next_level: Option<NestedPayload>,
    children: Arc<Mutex<HashMap<u64, ChildSlot>>>,
    next_child: AtomicU64,
}

impl NestedSessionManager {
    pub fn new(connector: Arc<dyn MasterConnector>) -> Self {
        Self {
            connector,
            executor_uri: DEFAULT_NESTED_EXECUTOR.to_string(),
            task_resources: Resources::default(),
            next_level: None,
            children: Arc::new(Mutex::new(HashMap::new())),
            next_child: AtomicU64::new(0),
        }
    }

    /// Executor the child framework asks for when its tasks are leaves.
    /// Its tasks carry a sleep payload.
    pub fn with_executor(mut self, uri: impl Into<String>) -> Self {
        self.executor_uri = uri.into();
        self
    }

    /// Make child tasks scaling tasks that run `next` one level down.
    pub fn with_next_level(mut self, next: NestedPayload) -> Self {
        self.next_level = Some(next);
        self
    }

    pub fn with_task_resources(mut self, resources: Resources) -> Self {
        self.task_resources = resources;
        self
    }

    /// Run a child session of `todo` tasks on `master` to completion.
    ///
    /// Dropping the returned future stops the child session.
    pub async fn run_nested(
        &self,
        master: &str,
        todo: Todo,
        duration: Duration,
    ) -> ExecutorResult<SessionReport> {
        self.run_child(master, todo, duration, None).await
    }

    /// Like [`run_nested`](Self::run_nested), but stops the child as soon
    /// as it is registered if `kill` has already fired.
    pub async fn run_nested_until(
        &self,
        master: &str,
        todo: Todo,
        duration: Duration,
        kill: KillSignal,
    ) -> ExecutorResult<SessionReport> {
        self.run_child(master, todo, duration, Some(kill)).await
    }

    async fn run_child(
        &self,
        master: &str,
        todo: Todo,
        duration: Duration,
        kill: Option<KillSignal>,
    ) -> ExecutorResult<SessionReport> {
        let (executor, payload) = self.child_task(master, duration)?;
        let framework = FrameworkInfo {
            name: format!(
                "Nested Framework: {todo} todo at {}ms",
                duration.as_millis()
            ),
            executor: ExecutorInfo::new(executor),
        };
        let connection = self
            .connector
            .connect(master, framework.clone())
            .map_err(|source| ExecutorError::Connect {
                master: master.to_string(),
                source,
            })?;

        let template = TaskSpec {
            name: "nested".to_string(),
            resources: self.task_resources,
            payload,
        };
        let session = SchedulerCore::for_todo(framework, connection.driver, todo, template)
            .spawn(connection.events);

        let id = self.next_child.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        let stop = session.stop_handle();
        self.lock().insert(
            id,
            ChildSlot {
                master: master.to_string(),
                stop: stop.clone(),
                done: done_rx,
            },
        );
        info!(child = id, %master, %todo, ?duration, "nested session started");
        if kill.is_some_and(|kill| kill.is_killed()) {
            debug!(child = id, "killed before start, stopping nested session");
            stop.stop();
        }

        let (result_tx, result_rx) = oneshot::channel();
        let children = Arc::clone(&self.children);
        tokio::spawn(async move {
            let result = session.join().await;
            children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            let _ = done_tx.send(true);
            let _ = result_tx.send(result);
        });

        let guard = StopOnDrop(Some(stop));
        let result = result_rx.await.unwrap_or(Err(SchedulerError::Disconnected));
        guard.disarm();

        match &result {
            Ok(report) => info!(
                child = id,
                finished = report.finished,
                failed = report.failed,
                reason = ?report.reason,
                "nested session ended"
            ),
            Err(e) => warn!(child = id, error = %e, "nested session failed"),
        }
        result.map_err(|source| ExecutorError::NestedSession {
            master: master.to_string(),
            source,
        })
    }

    /// Executor uri and encoded payload of the child session's tasks.
    fn child_task(&self, master: &str, duration: Duration) -> ExecutorResult<(&str, Vec<u8>)> {
        match &self.next_level {
            Some(next) => Ok((SCALING_EXECUTOR, codec::encode(next)?)),
            None if self.executor_uri == SCALING_EXECUTOR => Err(ExecutorError::MissingNextLevel {
                master: master.to_string(),
            }),
            None => Ok((
                self.executor_uri.as_str(),
                codec::encode(&SleepPayload::new(duration))?,
            )),
        }
    }

    /// Stop every live child session and wait for each to tear down.
    ///
    /// Calling it again, or with nothing running, does nothing.
    pub async fn cancel_nested(&self) {
        let waiting: Vec<(u64, watch::Receiver<bool>)> = {
            let children = self.lock();
            children
                .iter()
                .map(|(id, child)| {
                    child.stop.stop();
                    (*id, child.done.clone())
                })
                .collect()
        };
        for (id, mut done) in waiting {
            debug!(child = id, "waiting for nested session to stop");
            let _ = done.wait_for(|done| *done).await;
        }
    }

    /// Child sessions that have not finished yet, ordered by start.
    pub fn active_sessions(&self) -> Vec<ChildSession> {
        let mut sessions: Vec<ChildSession> = self
            .lock()
            .iter()
            .map(|(id, child)| ChildSession {
                id: *id,
                master: child.master.clone(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ChildSlot>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct StopOnDrop(Option<StopHandle>);

impl StopOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(stop) = self.0.take() {
            stop.stop();
        }
    }
}

// ── Workload ────────────────────────────────────────────────────────

/// Runs one child session per launched task.
pub struct NestedWorkload {
    manager: NestedSessionManager,
    payload: NestedPayload,
}

impl Workload for NestedWorkload {
    fn run(self: Box<Self>, mut kill: KillSignal) -> BoxFuture<TaskOutcome> {
        Box::pin(async move {
            let payload = &self.payload;
            debug!(master = %payload.master, levels = payload.depth(), "starting nested workload");
            let run = self.manager.run_nested_until(
                &payload.master,
                payload.todo,
                payload.duration(),
                kill.clone(),
            );
            tokio::pin!(run);

            // Polling `run` first registers the child before a pending kill
            // is seen, so the cancel below always finds it.
            let result = tokio::select! {
                biased;
                result = &mut run => result,
                _ = kill.killed() => {
                    debug!(master = %payload.master, "killed, cancelling nested session");
                    self.manager.cancel_nested().await;
                    run.await
                }
            };

            match result {
                Ok(_) => TaskOutcome::Finished,
                Err(e) => TaskOutcome::Failed(e.to_string()),
            }
        })
    }
}

/// Builds [`NestedWorkload`]s from [`NestedPayload`]s.
///
/// Every workload gets its own manager, so killing one task cancels only
/// the child session that task started. A payload with a `next` level
/// makes that child a scaling framework in turn.
pub struct NestedWorkloadFactory {
    connector: Arc<dyn MasterConnector>,
    executor_uri: String,
    task_resources: Resources,
}

impl NestedWorkloadFactory {
    pub fn new(connector: Arc<dyn MasterConnector>) -> Self {
        Self {
            connector,
            executor_uri: DEFAULT_NESTED_EXECUTOR.to_string(),
            task_resources: Resources::default(),
        }
    }

    pub fn with_executor(mut self, uri: impl Into<String>) -> Self {
        self.executor_uri = uri.into();
        self
    }

    pub fn with_task_resources(mut self, resources: Resources) -> Self {
        self.task_resources = resources;
        self
    }
}

impl WorkloadFactory for NestedWorkloadFactory {
    fn build(&self, task: &TaskDescription) -> ExecutorResult<Box<dyn Workload>> {
        let payload: NestedPayload = codec::decode(&task.payload)?;
        let mut manager = NestedSessionManager::new(Arc::clone(&self.connector))
            .with_executor(self.executor_uri.as_str())
            .with_task_resources(self.task_resources);
        if let Some(next) = &payload.next {
            manager = manager.with_next_level(next.as_ref().clone());
        }
        Ok(Box::new(NestedWorkload { manager, payload }))
    }
}
