//! Workloads: the unit of work an executor runs for one task.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use slot_core::codec::{self, SleepPayload};
use slot_core::TaskDescription;

use crate::error::ExecutorResult;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// How a workload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    Failed(String),
}

/// Fires when the executor wants the workload to stop.
///
/// Workloads that never poll it are not cooperatively cancellable; the
/// runtime aborts them once the kill grace period runs out.
#[derive(Clone)]
pub struct KillSignal(watch::Receiver<bool>);

impl KillSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    /// Resolves once a kill was requested or the executor went away.
    pub async fn killed(&mut self) {
        let _ = self.0.wait_for(|killed| *killed).await;
    }

    pub fn is_killed(&self) -> bool {
        *self.0.borrow()
    }
}

/// A unit of work run off the executor's message-handling path.
pub trait Workload: Send {
    fn run(self: Box<Self>, kill: KillSignal) -> BoxFuture<TaskOutcome>;
}

/// Turns a task description into a runnable workload.
pub trait WorkloadFactory: Send + Sync {
    fn build(&self, task: &TaskDescription) -> ExecutorResult<Box<dyn Workload>>;
}

/// Sleeps for a fixed duration. Wakes early when killed.
pub struct SleepWorkload {
    duration: Duration,
}

impl SleepWorkload {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Workload for SleepWorkload {
    fn run(self: Box<Self>, mut kill: KillSignal) -> BoxFuture<TaskOutcome> {
        Box::pin(async move {
            debug!(duration = ?self.duration, "sleeping");
            tokio::select! {
                _ = tokio::time::sleep(self.duration) => {}
                _ = kill.killed() => debug!("sleep interrupted by kill"),
            }
            TaskOutcome::Finished
        })
    }
}

/// Builds [`SleepWorkload`]s from [`SleepPayload`]s.
#[derive(Debug, Clone, Default)]
pub struct SleepWorkloadFactory;

impl WorkloadFactory for SleepWorkloadFactory {
    fn build(&self, task: &TaskDescription) -> ExecutorResult<Box<dyn Workload>> {
        let payload: SleepPayload = codec::decode(&task.payload)?;
        Ok(Box::new(SleepWorkload::new(payload.duration())))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Instant;

    use slot_core::{Resources, SlaveId, TaskId};

    use super::*;
    use crate::error::ExecutorError;

    fn task(payload: Vec<u8>) -> TaskDescription {
        TaskDescription {
            task_id: TaskId(0),
            slave_id: SlaveId::new("s1"),
            name: "sleep".to_string(),
            resources: Resources::default(),
            params: HashMap::new(),
            payload,
        }
    }

    #[tokio::test]
    async fn sleep_runs_to_completion() {
        let (_tx, rx) = watch::channel(false);
        let workload = Box::new(SleepWorkload::new(Duration::from_millis(10)));
        assert_eq!(workload.run(KillSignal::new(rx)).await, TaskOutcome::Finished);
    }

    #[tokio::test]
    async fn sleep_wakes_on_kill() {
        let (tx, rx) = watch::channel(false);
        let workload = Box::new(SleepWorkload::new(Duration::from_secs(60)));
        let started = Instant::now();
        let run = tokio::spawn(workload.run(KillSignal::new(rx)));

        tx.send(true).unwrap();
        assert_eq!(run.await.unwrap(), TaskOutcome::Finished);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn factory_decodes_sleep_payload() {
        let bytes = codec::encode(&SleepPayload::new(Duration::from_millis(5))).unwrap();
        assert!(SleepWorkloadFactory.build(&task(bytes)).is_ok());
    }

    #[test]
    fn factory_rejects_bad_payload() {
        let result = SleepWorkloadFactory.build(&task(b"not json".to_vec()));
        assert!(matches!(result, Err(ExecutorError::Payload(_))));
    }
}
