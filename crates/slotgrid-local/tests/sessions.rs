//! End-to-end scheduling sessions against in-process masters.
//!
//! Every test builds a small cluster with `top`, `nested` and `deep`
//! masters, runs real `SchedulerCore` sessions against it and checks the
//! final accounting. Offer intervals are short so the tests finish quickly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use slot_core::codec::{self, NestedPayload, SleepPayload};
use slot_core::config::{ExecutorConfig, MasterConfig, NestedConfig};
use slot_core::{
    Connection, DriverResult, ExecutorDriver, ExecutorInfo, FrameworkId, FrameworkInfo,
    MasterConnector, QualifiedTaskId, Resources, SchedulerEvent, SlaveId, TaskDescription,
    TaskId, TaskSpec, TaskState, TaskStatus, Todo,
};
use slotgrid_executor::{
    ExecutorRuntime, NestedSessionManager, NestedWorkloadFactory, SCALING_EXECUTOR,
    SLEEP_EXECUTOR,
};
use slotgrid_local::{LocalCluster, LocalMaster};
use slotgrid_scheduler::{
    SchedulerCore, SchedulerError, SessionHandle, SessionReport, TerminationReason,
};

const DEADLINE: Duration = Duration::from_secs(20);

fn master(address: &str) -> LocalMaster {
    LocalMaster::new(
        MasterConfig {
            address: address.to_string(),
            slaves: 4,
            slave_cpus: 2.0,
            slave_mem_bytes: 1024 * 1024 * 1024,
            offer_interval_ms: 10,
        },
        ExecutorConfig {
            kill_grace_ms: 500,
            ..ExecutorConfig::default()
        },
    )
}

fn cluster() -> LocalCluster {
    let cluster = LocalCluster::new();
    cluster.add_master(master("top"));
    cluster.add_master(master("nested"));
    cluster.add_master(master("deep"));
    cluster.register_builtin_executors(&NestedConfig::default(), Resources::default());
    cluster.start();
    cluster
}

fn framework(name: &str, executor: &str) -> FrameworkInfo {
    FrameworkInfo {
        name: name.to_string(),
        executor: ExecutorInfo::new(executor),
    }
}

fn sleep_spec(ms: u64) -> TaskSpec {
    TaskSpec {
        name: "sleep".to_string(),
        resources: Resources::default(),
        payload: codec::encode(&SleepPayload::new(Duration::from_millis(ms))).unwrap(),
    }
}

fn nested_payload(master: &str, todo: Todo, ms: u64) -> NestedPayload {
    NestedPayload::new(master, todo, Duration::from_millis(ms))
}

fn scaling_spec(master: &str, todo: Todo, ms: u64) -> TaskSpec {
    scaling_spec_for(nested_payload(master, todo, ms))
}

fn scaling_spec_for(payload: NestedPayload) -> TaskSpec {
    TaskSpec {
        name: "scaling".to_string(),
        resources: Resources::default(),
        payload: codec::encode(&payload).unwrap(),
    }
}

fn start_session(
    cluster: &LocalCluster,
    address: &str,
    framework: FrameworkInfo,
    todo: Todo,
    template: TaskSpec,
) -> SessionHandle {
    let connection = cluster.connect(address, framework.clone()).unwrap();
    SchedulerCore::for_todo(framework, connection.driver, todo, template).spawn(connection.events)
}

async fn join(handle: SessionHandle) -> Result<SessionReport, SchedulerError> {
    tokio::time::timeout(DEADLINE, handle.join())
        .await
        .expect("session did not finish in time")
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(DEADLINE, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// What one session saw on its event stream.
#[derive(Default)]
struct Tap {
    framework_id: Mutex<Option<FrameworkId>>,
    finished: Mutex<Vec<TaskId>>,
}

impl Tap {
    fn finished(&self) -> Vec<TaskId> {
        self.finished.lock().unwrap().clone()
    }

    fn qualified(&self) -> Vec<QualifiedTaskId> {
        let framework_id = self.framework_id.lock().unwrap().clone().unwrap();
        self.finished()
            .into_iter()
            .map(|task_id| QualifiedTaskId::new(framework_id.clone(), task_id))
            .collect()
    }
}

/// Forward `upstream` through `tap`. `on_finished` runs for every FINISHED
/// update before the session sees it.
fn tap_events(
    mut upstream: mpsc::UnboundedReceiver<SchedulerEvent>,
    tap: Arc<Tap>,
    on_finished: impl Fn(TaskId) + Send + 'static,
) -> mpsc::UnboundedReceiver<SchedulerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = upstream.recv().await {
            match &event {
                SchedulerEvent::Registered(id) => {
                    *tap.framework_id.lock().unwrap() = Some(id.clone());
                }
                SchedulerEvent::StatusUpdate(status) if status.state == TaskState::Finished => {
                    tap.finished.lock().unwrap().push(status.task_id);
                    on_finished(status.task_id);
                }
                _ => {}
            }
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    rx
}

/// Connects child sessions through the cluster and taps each one.
struct TappingConnector {
    cluster: LocalCluster,
    children: Arc<Mutex<Vec<Arc<Tap>>>>,
}

impl MasterConnector for TappingConnector {
    fn connect(&self, address: &str, framework: FrameworkInfo) -> DriverResult<Connection> {
        let connection = self.cluster.connect(address, framework)?;
        let tap = Arc::new(Tap::default());
        self.children.lock().unwrap().push(Arc::clone(&tap));
        Ok(Connection {
            driver: connection.driver,
            events: tap_events(connection.events, tap, |_| {}),
        })
    }
}

/// A scaling session on `top` whose nested sessions are all tapped.
struct TappedRun {
    parent: Arc<Tap>,
    children: Arc<Mutex<Vec<Arc<Tap>>>>,
    /// Children that had seen all five of their tasks finish, sampled as
    /// each parent FINISHED arrived.
    complete_children: Arc<Mutex<Vec<usize>>>,
    report: SessionReport,
}

async fn tapped_scaling_run(parent_todo: u64) -> TappedRun {
    let cluster = cluster();
    let children = Arc::new(Mutex::new(Vec::<Arc<Tap>>::new()));
    let connector = TappingConnector {
        cluster: cluster.clone(),
        children: Arc::clone(&children),
    };
    cluster.master("top").unwrap().register_executor(
        SCALING_EXECUTOR,
        Arc::new(NestedWorkloadFactory::new(Arc::new(connector))),
    );

    let info = framework("scaling", SCALING_EXECUTOR);
    let connection = cluster.connect("top", info.clone()).unwrap();
    let parent = Arc::new(Tap::default());
    let complete_children = Arc::new(Mutex::new(Vec::new()));
    let events = {
        let children = Arc::clone(&children);
        let complete_children = Arc::clone(&complete_children);
        tap_events(connection.events, Arc::clone(&parent), move |_| {
            let complete = children
                .lock()
                .unwrap()
                .iter()
                .filter(|child| child.finished().len() == 5)
                .count();
            complete_children.lock().unwrap().push(complete);
        })
    };
    let handle = SchedulerCore::for_todo(
        info,
        connection.driver,
        Todo::Bounded(parent_todo),
        scaling_spec("nested", Todo::Bounded(5), 1),
    )
    .spawn(events);

    let report = join(handle).await.unwrap();
    cluster.shutdown().await;
    TappedRun {
        parent,
        children,
        complete_children,
        report,
    }
}

#[derive(Default)]
struct RecordingExecutorDriver {
    statuses: Mutex<Vec<TaskStatus>>,
}

impl ExecutorDriver for RecordingExecutorDriver {
    fn send_status_update(&self, status: TaskStatus) -> DriverResult<()> {
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }
}

#[tokio::test]
async fn bounded_session_runs_exactly_todo_tasks() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("sleepers", SLEEP_EXECUTOR),
        Todo::Bounded(3),
        sleep_spec(5),
    );

    let report = join(handle).await.unwrap();
    assert_eq!(report.framework_id, Some(FrameworkId::new("top-1")));
    assert_eq!(report.launched, 3);
    assert_eq!(report.finished, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.reason, Some(TerminationReason::Completed));

    let top = cluster.master("top").unwrap();
    assert!(top.frameworks().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn zero_todo_completes_on_registration() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("idle", SLEEP_EXECUTOR),
        Todo::Bounded(0),
        sleep_spec(5),
    );

    let report = join(handle).await.unwrap();
    assert_eq!(report.launched, 0);
    assert_eq!(report.reason, Some(TerminationReason::Completed));
    cluster.shutdown().await;
}

#[tokio::test]
async fn scaling_tasks_finish_after_their_nested_sessions() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("scaling", SCALING_EXECUTOR),
        Todo::Bounded(2),
        scaling_spec("nested", Todo::Bounded(5), 1),
    );

    let report = join(handle).await.unwrap();
    assert_eq!(report.finished, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.reason, Some(TerminationReason::Completed));

    // Both child frameworks registered on the nested master and left again.
    let nested = cluster.master("nested").unwrap();
    assert!(nested.frameworks().is_empty());
    let mut late = nested.connect(framework("late", SLEEP_EXECUTOR));
    assert_eq!(
        late.events.recv().await,
        Some(SchedulerEvent::Registered(FrameworkId::new("nested-3")))
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn parent_finishes_only_after_child_countdown() {
    let run = tapped_scaling_run(2).await;
    assert_eq!(run.report.finished, 2);

    let complete_children = run.complete_children.lock().unwrap().clone();
    assert_eq!(complete_children.len(), 2);
    for (seen, complete) in complete_children.iter().enumerate() {
        assert!(
            *complete > seen,
            "parent FINISHED #{} arrived with only {complete} complete child sessions",
            seen + 1
        );
    }
    let children = run.children.lock().unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|child| child.finished().len() == 5));
}

#[tokio::test]
async fn nested_task_ids_are_qualified_by_framework() {
    let run = tapped_scaling_run(2).await;

    let parent = run.parent.qualified();
    assert_eq!(
        run.report.qualify(TaskId(0)).as_ref(),
        parent.iter().find(|q| q.task_id == TaskId(0))
    );

    let children = run.children.lock().unwrap();
    let mut all: HashSet<QualifiedTaskId> = parent.iter().cloned().collect();
    for child in children.iter() {
        // Every session counts from zero on its own.
        assert!(child.finished().contains(&TaskId(0)));
        for qualified in child.qualified() {
            assert_ne!(qualified.framework_id, parent[0].framework_id);
            assert!(all.insert(qualified), "qualified id seen twice");
        }
    }
    assert!(run.parent.finished().contains(&TaskId(0)));
    assert_eq!(all.len(), 2 + 2 * 5);
}

#[tokio::test]
async fn scaling_sessions_nest_two_levels() {
    let cluster = cluster();
    let payload = nested_payload("nested", Todo::Bounded(2), 1)
        .with_next(nested_payload("deep", Todo::Bounded(2), 1));
    let handle = start_session(
        &cluster,
        "top",
        framework("tree", SCALING_EXECUTOR),
        Todo::Bounded(1),
        scaling_spec_for(payload),
    );

    let report = join(handle).await.unwrap();
    assert_eq!(report.finished, 1);
    assert_eq!(report.failed, 0);

    // One child on `nested`, whose two tasks each opened a session on `deep`.
    let nested = cluster.master("nested").unwrap();
    let deep = cluster.master("deep").unwrap();
    assert!(nested.frameworks().is_empty());
    assert!(deep.frameworks().is_empty());
    let mut late = nested.connect(framework("late", SLEEP_EXECUTOR));
    assert_eq!(
        late.events.recv().await,
        Some(SchedulerEvent::Registered(FrameworkId::new("nested-2")))
    );
    let mut late = deep.connect(framework("late", SLEEP_EXECUTOR));
    assert_eq!(
        late.events.recv().await,
        Some(SchedulerEvent::Registered(FrameworkId::new("deep-3")))
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn immediate_kill_tears_down_nested_session() {
    let cluster = cluster();
    let nested = cluster.master("nested").unwrap();
    let driver = Arc::new(RecordingExecutorDriver::default());
    let grace = Duration::from_secs(2);
    let mut runtime = ExecutorRuntime::new(
        driver.clone(),
        Arc::new(NestedWorkloadFactory::new(Arc::new(cluster.clone()))),
        ExecutorConfig {
            kill_grace_ms: grace.as_millis() as u64,
            ..ExecutorConfig::default()
        },
    );
    let payload = codec::encode(&nested_payload("nested", Todo::Unbounded, 5)).unwrap();

    for n in 0..10 {
        let task_id = TaskId(n);
        runtime
            .launch(TaskDescription {
                task_id,
                slave_id: SlaveId::new("top-slave-0"),
                name: format!("scaling:{n}"),
                resources: Resources::default(),
                params: HashMap::new(),
                payload: payload.clone(),
            })
            .await
            .unwrap();

        let started = Instant::now();
        runtime.kill(task_id).await.unwrap();
        assert!(
            started.elapsed() < grace / 2,
            "kill of task {n} took {:?}",
            started.elapsed()
        );
        assert!(nested.frameworks().is_empty(), "child of task {n} outlived its kill");
    }

    let statuses = driver.statuses.lock().unwrap().clone();
    let finished = statuses
        .iter()
        .filter(|s| s.state == TaskState::Finished)
        .count();
    assert_eq!(finished, 10);
    assert_eq!(runtime.active_count(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn nested_failure_fails_the_parent_task() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("scaling", SCALING_EXECUTOR),
        Todo::Bounded(1),
        scaling_spec("missing", Todo::Bounded(1), 1),
    );

    // The parent task fails and is not retried, so the session never
    // reaches its todo on its own.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());
    handle.stop();

    let report = join(handle).await.unwrap();
    assert_eq!(report.launched, 1);
    assert_eq!(report.finished, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.reason, Some(TerminationReason::Stopped));
    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_sessions_get_separate_namespaces() {
    let cluster = cluster();
    let a = start_session(
        &cluster,
        "top",
        framework("a", SLEEP_EXECUTOR),
        Todo::Bounded(2),
        sleep_spec(5),
    );
    let b = start_session(
        &cluster,
        "top",
        framework("b", SLEEP_EXECUTOR),
        Todo::Bounded(2),
        sleep_spec(5),
    );

    let a = join(a).await.unwrap();
    let b = join(b).await.unwrap();
    assert_ne!(a.framework_id, b.framework_id);
    assert_eq!(a.finished, 2);
    assert_eq!(b.finished, 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn unbounded_session_runs_until_stopped() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("forever", SLEEP_EXECUTOR),
        Todo::Unbounded,
        sleep_spec(5),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());
    handle.stop();

    let report = join(handle).await.unwrap();
    assert_eq!(report.todo, Todo::Unbounded);
    assert!(report.launched > 0);
    assert_eq!(report.reason, Some(TerminationReason::Stopped));

    let top = cluster.master("top").unwrap();
    assert!(top.frameworks().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn stopping_parent_tears_down_nested_sessions() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("scaling", SCALING_EXECUTOR),
        Todo::Bounded(1),
        scaling_spec("nested", Todo::Unbounded, 5),
    );

    let nested = cluster.master("nested").unwrap();
    wait_until(|| !nested.frameworks().is_empty()).await;
    handle.stop();

    let report = join(handle).await.unwrap();
    assert_eq!(report.reason, Some(TerminationReason::Stopped));
    wait_until(|| nested.frameworks().is_empty()).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn unknown_executor_fails_registration() {
    let cluster = cluster();
    let handle = start_session(
        &cluster,
        "top",
        framework("broken", "no-such-executor"),
        Todo::Bounded(1),
        sleep_spec(5),
    );

    let result = join(handle).await;
    assert!(matches!(result, Err(SchedulerError::Registration(_))));
    cluster.shutdown().await;
}

#[tokio::test]
async fn run_nested_reports_child_session() {
    let cluster = cluster();
    let manager = NestedSessionManager::new(Arc::new(cluster.clone()));

    let report = tokio::time::timeout(
        DEADLINE,
        manager.run_nested("nested", Todo::Bounded(5), Duration::from_millis(1)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.framework_id, Some(FrameworkId::new("nested-1")));
    assert_eq!(report.finished, 5);
    assert!(manager.active_sessions().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn cancel_nested_stops_and_joins() {
    let cluster = cluster();
    let manager = Arc::new(NestedSessionManager::new(Arc::new(cluster.clone())));

    let running = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .run_nested("nested", Todo::Unbounded, Duration::from_millis(5))
                .await
        })
    };
    wait_until(|| manager.active_sessions().len() == 1).await;
    assert_eq!(manager.active_sessions()[0].master, "nested");

    manager.cancel_nested().await;
    assert!(manager.active_sessions().is_empty());
    manager.cancel_nested().await;

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.reason, Some(TerminationReason::Stopped));
    cluster.shutdown().await;
}
