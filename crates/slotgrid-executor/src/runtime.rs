//! Executor runtime: runs launched tasks and reports their status.
//!
//! The runtime consumes `ExecutorEvent`s on a single task. In `Worker`
//! mode each workload gets its own tokio task and reports back through an
//! internal completion channel, so kills and shutdowns are handled while
//! work is in progress. In `Inline` mode the handler awaits the workload
//! and later events queue up behind it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use slot_core::config::{ExecutionMode, ExecutorConfig};
use slot_core::{ExecutorDriver, ExecutorEvent, TaskDescription, TaskId, TaskState, TaskStatus};

use crate::error::ExecutorResult;
use crate::workload::{KillSignal, TaskOutcome, WorkloadFactory};

type Completion = (TaskId, TaskOutcome);

/// A workload that has been launched and not yet reported.
struct ActiveTask {
    kill_tx: watch::Sender<bool>,
    /// Present in `Worker` mode only.
    handle: Option<JoinHandle<()>>,
}

/// Runs tasks for one framework on one slave.
pub struct ExecutorRuntime {
    driver: Arc<dyn ExecutorDriver>,
    factory: Arc<dyn WorkloadFactory>,
    config: ExecutorConfig,
    active: HashMap<TaskId, ActiveTask>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Option<mpsc::UnboundedReceiver<Completion>>,
}

impl ExecutorRuntime {
    pub fn new(
        driver: Arc<dyn ExecutorDriver>,
        factory: Arc<dyn WorkloadFactory>,
        config: ExecutorConfig,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            driver,
            factory,
            config,
            active: HashMap::new(),
            completions_tx,
            completions_rx: Some(completions_rx),
        }
    }

    /// Spawn the runtime on its own task and return its event sender.
    pub fn spawn(self) -> (mpsc::UnboundedSender<ExecutorEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Handle events until `Shutdown` or until the sender goes away.
    ///
    /// Either way every active task is killed before returning.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ExecutorEvent>) {
        let Some(mut completions) = self.completions_rx.take() else {
            error!("executor runtime started twice");
            return;
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ExecutorEvent::Shutdown) | None => break,
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            warn!(error = %e, "executor event failed");
                        }
                    }
                },
                Some((task_id, outcome)) = completions.recv() => {
                    if let Err(e) = self.complete(task_id, outcome) {
                        warn!(%task_id, error = %e, "status update failed");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    pub async fn handle_event(&mut self, event: ExecutorEvent) -> ExecutorResult<()> {
        match event {
            ExecutorEvent::Launch(task) => self.launch(task).await,
            ExecutorEvent::Kill(task_id) => self.kill(task_id).await,
            ExecutorEvent::Shutdown => {
                self.shutdown().await;
                Ok(())
            }
            ExecutorEvent::Error { code, message } => {
                error!(code, %message, "error from master");
                Ok(())
            }
        }
    }

    /// Number of launched tasks not yet reported.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start a task's workload.
    ///
    /// A payload that does not decode, or a task id that is already
    /// running here, is answered with FAILED instead.
    pub async fn launch(&mut self, task: TaskDescription) -> ExecutorResult<()> {
        let task_id = task.task_id;

        if self.active.contains_key(&task_id) {
            warn!(%task_id, "task id already running, rejecting launch");
            return self.send(
                TaskStatus::new(task_id, TaskState::Failed).with_message("duplicate task id"),
            );
        }

        let workload = match self.factory.build(&task) {
            Ok(workload) => workload,
            Err(e) => {
                warn!(%task_id, error = %e, "cannot build workload");
                return self.send(
                    TaskStatus::new(task_id, TaskState::Failed).with_message(e.to_string()),
                );
            }
        };

        info!(%task_id, name = %task.name, mode = ?self.config.mode, "launching task");
        self.send(TaskStatus::new(task_id, TaskState::Running))?;

        let (kill_tx, kill_rx) = watch::channel(false);
        let kill = KillSignal::new(kill_rx);

        match self.config.mode {
            ExecutionMode::Worker => {
                let completions = self.completions_tx.clone();
                let handle = tokio::spawn(async move {
                    let outcome = workload.run(kill).await;
                    let _ = completions.send((task_id, outcome));
                });
                self.active.insert(
                    task_id,
                    ActiveTask {
                        kill_tx,
                        handle: Some(handle),
                    },
                );
                Ok(())
            }
            ExecutionMode::Inline => {
                self.active.insert(
                    task_id,
                    ActiveTask {
                        kill_tx,
                        handle: None,
                    },
                );
                let outcome = workload.run(kill).await;
                self.complete(task_id, outcome)
            }
        }
    }

    /// Stop a task and report it FINISHED.
    ///
    /// The workload is signalled and given `kill_grace` to wind down,
    /// then aborted. FINISHED (not KILLED) is reported either way, so the
    /// scheduler sees the resources as reclaimed. A kill for a task that is
    /// not running here is still answered with FINISHED.
    pub async fn kill(&mut self, task_id: TaskId) -> ExecutorResult<()> {
        match self.active.remove(&task_id) {
            Some(task) => self.stop_task(task_id, task).await,
            None => warn!(%task_id, "expecting a different task id, killing anyway"),
        }
        self.send(TaskStatus::new(task_id, TaskState::Finished).with_message("killed"))
    }

    /// Kill every active task.
    pub async fn shutdown(&mut self) {
        let mut ids: Vec<TaskId> = self.active.keys().copied().collect();
        ids.sort();
        info!(active = ids.len(), "executor shutting down");
        for task_id in ids {
            if let Err(e) = self.kill(task_id).await {
                warn!(%task_id, error = %e, "status update failed during shutdown");
            }
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn stop_task(&self, task_id: TaskId, task: ActiveTask) {
        let _ = task.kill_tx.send(true);
        let Some(mut handle) = task.handle else {
            return;
        };
        match tokio::time::timeout(self.config.kill_grace(), &mut handle).await {
            Ok(_) => debug!(%task_id, "workload stopped"),
            Err(_) => {
                warn!(%task_id, grace = ?self.config.kill_grace(), "workload ignored kill, aborting");
                handle.abort();
            }
        }
    }

    /// Report a workload's outcome unless the task was killed meanwhile.
    fn complete(&mut self, task_id: TaskId, outcome: TaskOutcome) -> ExecutorResult<()> {
        if self.active.remove(&task_id).is_none() {
            debug!(%task_id, "completion for killed task dropped");
            return Ok(());
        }
        let status = match outcome {
            TaskOutcome::Finished => {
                info!(%task_id, "task finished");
                TaskStatus::new(task_id, TaskState::Finished)
            }
            TaskOutcome::Failed(reason) => {
                warn!(%task_id, %reason, "task failed");
                TaskStatus::new(task_id, TaskState::Failed).with_message(reason)
            }
        };
        self.send(status)
    }

    fn send(&self, status: TaskStatus) -> ExecutorResult<()> {
        self.driver.send_status_update(status)?;
        Ok(())
    }
}
