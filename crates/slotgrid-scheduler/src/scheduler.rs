//! Scheduler core: the state machine behind one scheduling session.
//!
//! ```text
//! Unregistered ──registered──▶ Registered ──first offer──▶ Running
//!      │                            │                          │
//!      └──error──▶ Terminated ◀─────┴── finished == todo, stop, ┘
//!                                       master error
//! ```
//!
//! The core is driven either directly through its handler methods or by
//! [`SchedulerCore::run`], which consumes master events from a channel on
//! a single task. Handlers never interleave within one session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use slot_core::driver::REFUSE_SECONDS;
use slot_core::{
    FrameworkId, FrameworkInfo, Offer, OfferId, QualifiedTaskId, SchedulerDriver,
    SchedulerEvent, SlaveId, TaskId, TaskSpec, TaskState, TaskStatus, Todo,
};

use crate::allocator::{OfferAllocator, PendingTasks};
use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::TaskRegistry;

/// Lifecycle of a scheduling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered,
    Running,
    Terminated,
}

/// Why a session reached `Terminated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Every task in a bounded session finished.
    Completed,
    /// Stopped on request.
    Stopped,
    RegistrationFailed(String),
    MasterError { code: i32, message: String },
    Disconnected,
    DriverFailure(String),
}

/// Final accounting of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub framework_id: Option<FrameworkId>,
    pub todo: Todo,
    pub launched: u64,
    pub finished: u64,
    pub failed: u64,
    pub reason: Option<TerminationReason>,
}

impl SessionReport {
    /// Qualify a task id this session issued with its framework id.
    ///
    /// `None` if the session never registered or never issued the id.
    pub fn qualify(&self, task_id: TaskId) -> Option<QualifiedTaskId> {
        if task_id.0 >= self.launched {
            return None;
        }
        let framework_id = self.framework_id.clone()?;
        Some(QualifiedTaskId::new(framework_id, task_id))
    }
}

/// Drives one framework's scheduling session against a master.
pub struct SchedulerCore {
    framework: FrameworkInfo,
    driver: Arc<dyn SchedulerDriver>,
    registry: TaskRegistry,
    allocator: OfferAllocator,
    pending: PendingTasks,
    todo: Todo,
    state: SessionState,
    framework_id: Option<FrameworkId>,
    refuse_seconds: u64,
    reason: Option<TerminationReason>,
}

impl SchedulerCore {
    /// Create a session that schedules everything in `pending`.
    ///
    /// A bounded queue of N specs gives `todo = N`; an unbounded queue
    /// schedules forever.
    pub fn new(
        framework: FrameworkInfo,
        driver: Arc<dyn SchedulerDriver>,
        pending: PendingTasks,
    ) -> Self {
        let todo = match pending.remaining() {
            Some(n) => Todo::Bounded(n as u64),
            None => Todo::Unbounded,
        };
        Self {
            framework,
            driver,
            registry: TaskRegistry::new(),
            allocator: OfferAllocator::new(),
            pending,
            todo,
            state: SessionState::Unregistered,
            framework_id: None,
            refuse_seconds: 1,
            reason: None,
        }
    }

    /// Create a session running `todo` copies of `template`.
    pub fn for_todo(
        framework: FrameworkInfo,
        driver: Arc<dyn SchedulerDriver>,
        todo: Todo,
        template: TaskSpec,
    ) -> Self {
        Self::new(framework, driver, PendingTasks::from_todo(todo, template))
    }

    /// How long the master should hold back declined resources.
    pub fn with_refuse_seconds(mut self, refuse_seconds: u64) -> Self {
        self.refuse_seconds = refuse_seconds;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn framework_id(&self) -> Option<&FrameworkId> {
        self.framework_id.as_ref()
    }

    pub fn framework(&self) -> &FrameworkInfo {
        &self.framework
    }

    pub fn todo(&self) -> Todo {
        self.todo
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            framework_id: self.framework_id.clone(),
            todo: self.todo,
            launched: self.registry.issued(),
            finished: self.registry.finished(),
            failed: self.registry.failed(),
            reason: self.reason.clone(),
        }
    }

    /// Dispatch one master event to its handler.
    pub fn handle_event(&mut self, event: SchedulerEvent) -> SchedulerResult<()> {
        match event {
            SchedulerEvent::Registered(framework_id) => {
                self.registered(framework_id);
                Ok(())
            }
            SchedulerEvent::ResourceOffer { offer_id, offers } => {
                self.resource_offer(&offer_id, &offers)
            }
            SchedulerEvent::OfferRescinded(offer_id) => {
                self.offer_rescinded(&offer_id);
                Ok(())
            }
            SchedulerEvent::StatusUpdate(status) => self.status_update(&status),
            SchedulerEvent::SlaveLost(slave_id) => {
                self.slave_lost(&slave_id);
                Ok(())
            }
            SchedulerEvent::Error { code, message } => self.error(code, message),
        }
    }

    pub fn registered(&mut self, framework_id: FrameworkId) {
        if self.state != SessionState::Unregistered {
            warn!(%framework_id, state = ?self.state, "duplicate registration ignored");
            return;
        }
        info!(
            %framework_id,
            name = %self.framework.name,
            todo = %self.todo,
            "framework registered"
        );
        self.framework_id = Some(framework_id);
        self.state = SessionState::Registered;
        self.check_completion();
    }

    /// Answer an offer with at most one task per offered slave.
    ///
    /// Exactly one reply is sent per offer id, possibly empty. If the
    /// reply cannot be delivered the tasks it carried are recorded LOST
    /// and the driver error is returned.
    pub fn resource_offer(&mut self, offer_id: &OfferId, offers: &[Offer]) -> SchedulerResult<()> {
        match self.state {
            SessionState::Unregistered => {
                warn!(%offer_id, "offer before registration, declining");
                return self.decline(offer_id);
            }
            SessionState::Terminated => {
                debug!(%offer_id, "session terminated, declining offer");
                return self.decline(offer_id);
            }
            SessionState::Registered => {
                self.state = SessionState::Running;
                debug!(framework_id = %self.fid(), "session running");
            }
            SessionState::Running => {}
        }

        let mut tasks = Vec::new();
        for offer in offers {
            match self
                .allocator
                .allocate(offer_id, offer, &mut self.pending, &self.registry)
            {
                Ok(mut placed) => tasks.append(&mut placed),
                Err(e) => warn!(error = %e, "declining unusable offer"),
            }
        }

        let launched: Vec<TaskId> = tasks.iter().map(|t| t.task_id).collect();
        for task in &tasks {
            info!(
                framework_id = %self.fid(),
                task_id = %task.task_id,
                slave = %task.slave_id,
                "launching task"
            );
        }

        if let Err(e) = self
            .driver
            .reply_to_offer(offer_id, tasks, self.reply_params())
        {
            error!(%offer_id, error = %e, "offer reply failed");
            for task_id in launched {
                let _ = self.registry.record_terminal(task_id, TaskState::Lost);
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn offer_rescinded(&mut self, offer_id: &OfferId) {
        debug!(%offer_id, "offer rescinded");
    }

    /// Fold a task status into the registry and check for completion.
    ///
    /// FAILED and LOST are counted but never retried.
    pub fn status_update(&mut self, status: &TaskStatus) -> SchedulerResult<()> {
        let task_id = status.task_id;
        match self.state {
            SessionState::Terminated => {
                debug!(%task_id, state = %status.state, "status after termination ignored");
                return Ok(());
            }
            SessionState::Unregistered => {
                warn!(%task_id, state = %status.state, "status before registration ignored");
                return Ok(());
            }
            SessionState::Registered | SessionState::Running => {}
        }

        debug!(
            framework_id = %self.fid(),
            %task_id,
            state = %status.state,
            message = %status.message,
            "status update"
        );

        match status.state {
            TaskState::Staging => {}
            TaskState::Running => {
                if let Err(e) = self.registry.record_running(task_id) {
                    warn!(error = %e, "running status for unknown task");
                }
            }
            TaskState::Finished => {
                self.registry.record_finished(task_id)?;
                info!(
                    framework_id = %self.fid(),
                    %task_id,
                    finished = self.registry.finished(),
                    todo = %self.todo,
                    "task finished"
                );
            }
            TaskState::Failed | TaskState::Lost => {
                self.registry.record_terminal(task_id, status.state)?;
                warn!(
                    framework_id = %self.fid(),
                    %task_id,
                    state = %status.state,
                    failed = self.registry.failed(),
                    "task failed, not retrying"
                );
            }
            TaskState::Killed => {
                self.registry.record_terminal(task_id, status.state)?;
            }
        }

        self.check_completion();
        Ok(())
    }

    /// Every active task on the lost slave is recorded LOST.
    pub fn slave_lost(&mut self, slave_id: &SlaveId) {
        let lost = self.registry.on_slave(slave_id);
        warn!(%slave_id, tasks = lost.len(), "slave lost");
        for task_id in lost {
            let _ = self.registry.record_terminal(task_id, TaskState::Lost);
        }
    }

    /// A fatal notification from the master. Ends the session.
    pub fn error(&mut self, code: i32, message: String) -> SchedulerResult<()> {
        error!(code, %message, "master error");
        if self.state == SessionState::Unregistered {
            self.terminate(TerminationReason::RegistrationFailed(message.clone()));
            return Err(SchedulerError::Registration(message));
        }
        self.terminate(TerminationReason::MasterError {
            code,
            message: message.clone(),
        });
        Err(SchedulerError::Master { code, message })
    }

    /// Stop the session, killing every task still in flight.
    pub fn stop(&mut self) {
        self.terminate(TerminationReason::Stopped);
    }

    /// Run the session until it terminates.
    ///
    /// Events are handled one at a time in arrival order. A `true` on
    /// `stop` (or the stop sender going away) stops the session. Fatal
    /// errors terminate the session and are returned; non-fatal ones are
    /// logged and the session carries on.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> SchedulerResult<SessionReport> {
        if *stop.borrow_and_update() {
            self.stop();
        }

        while !self.is_terminated() {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        self.terminate(TerminationReason::Disconnected);
                        return Err(SchedulerError::Disconnected);
                    };
                    if let Err(e) = self.handle_event(event) {
                        if e.is_fatal() {
                            self.terminate(TerminationReason::DriverFailure(e.to_string()));
                            return Err(e);
                        }
                        warn!(error = %e, "event handling failed");
                    }
                }
                _ = stop.changed() => {
                    info!(framework_id = %self.fid(), "stop requested");
                    self.stop();
                }
            }
        }

        let report = self.report();
        info!(
            framework_id = %self.fid(),
            launched = report.launched,
            finished = report.finished,
            failed = report.failed,
            reason = ?report.reason,
            "session ended"
        );
        Ok(report)
    }

    /// Spawn [`run`](Self::run) on its own task.
    pub fn spawn(self, events: mpsc::UnboundedReceiver<SchedulerEvent>) -> SessionHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(events, stop_rx));
        SessionHandle {
            stop: StopHandle(Arc::new(stop_tx)),
            handle,
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn check_completion(&mut self) {
        if let Todo::Bounded(todo) = self.todo {
            if self.registry.finished() >= todo {
                info!(framework_id = %self.fid(), todo, "all tasks done, stopping scheduler");
                self.terminate(TerminationReason::Completed);
            }
        }
    }

    /// Move to `Terminated` once: kill in-flight tasks, then unregister.
    fn terminate(&mut self, reason: TerminationReason) {
        if self.is_terminated() {
            return;
        }
        for task_id in self.registry.active() {
            debug!(framework_id = %self.fid(), %task_id, "killing in-flight task");
            if let Err(e) = self.driver.kill_task(task_id) {
                warn!(%task_id, error = %e, "kill request failed");
            }
        }
        // A stop can arrive before `Registered` is read while the master
        // has already accepted the framework. Only a refusal needs no stop.
        if !matches!(reason, TerminationReason::RegistrationFailed(_)) {
            if let Err(e) = self.driver.stop() {
                warn!(error = %e, "driver stop failed");
            }
        }
        self.state = SessionState::Terminated;
        self.reason = Some(reason);
    }

    fn decline(&self, offer_id: &OfferId) -> SchedulerResult<()> {
        self.driver
            .reply_to_offer(offer_id, Vec::new(), self.reply_params())?;
        Ok(())
    }

    fn reply_params(&self) -> HashMap<String, String> {
        HashMap::from([(REFUSE_SECONDS.to_string(), self.refuse_seconds.to_string())])
    }

    fn fid(&self) -> &str {
        self.framework_id.as_ref().map_or("-", FrameworkId::as_str)
    }
}

/// Requests that a running session stop. Cheap to clone.
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// A session running on its own task.
pub struct SessionHandle {
    stop: StopHandle,
    handle: JoinHandle<SchedulerResult<SessionReport>>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the session to terminate.
    pub async fn join(self) -> SchedulerResult<SessionReport> {
        self.handle.await?
    }
}
