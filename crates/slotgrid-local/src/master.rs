//! In-process master.
//!
//! Owns a fixed set of slaves and hands their free resources to registered
//! frameworks as offers, one framework per round in rotation. Accepted
//! tasks are launched on a per-(framework, slave) [`ExecutorRuntime`];
//! status updates flow back through the master, which frees the slave's
//! resources on terminal states before forwarding them.
//!
//! ```text
//!              offer loop (interval)
//!                     │
//!   SchedulerCore ◀── ResourceOffer ── LocalMaster ── Launch ──▶ ExecutorRuntime
//!   SchedulerCore ─── reply_to_offer ─▶     ▲                         │
//!   SchedulerCore ◀── StatusUpdate ────────┴──── send_status_update ─┘
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use slot_core::config::{ExecutorConfig, MasterConfig};
use slot_core::driver::REFUSE_SECONDS;
use slot_core::{
    Connection, DriverError, DriverResult, ExecutorDriver, ExecutorEvent, FrameworkId,
    FrameworkInfo, Offer, OfferId, Resources, SchedulerDriver, SchedulerEvent, SlaveId,
    TaskDescription, TaskId, TaskState, TaskStatus,
};
use slotgrid_executor::{ExecutorRuntime, WorkloadFactory};

use crate::rotation::Rotation;

/// Error code sent to a framework whose registration is refused.
pub const REGISTRATION_REFUSED: i32 = 1;

/// Slack for floating-point cpu accounting.
const CPU_EPSILON: f64 = 1e-9;

// ── State ───────────────────────────────────────────────────────────

struct SlaveEntry {
    id: SlaveId,
    free: Resources,
    /// Part of an outstanding offer.
    offered: bool,
}

impl SlaveEntry {
    fn offerable(&self) -> bool {
        !self.offered && self.free.cpus > CPU_EPSILON && self.free.mem_bytes > 0
    }

    fn offer(&self) -> Offer {
        Offer {
            slave_id: self.id.clone(),
            resources: self.free,
            params: HashMap::from([
                ("cpus".to_string(), self.free.cpus.to_string()),
                ("mem".to_string(), self.free.mem_bytes.to_string()),
            ]),
        }
    }

    fn claim(&mut self, resources: &Resources) {
        self.free.cpus = (self.free.cpus - resources.cpus).max(0.0);
        self.free.mem_bytes = self.free.mem_bytes.saturating_sub(resources.mem_bytes);
    }

    fn release(&mut self, resources: &Resources) {
        self.free.cpus += resources.cpus;
        self.free.mem_bytes += resources.mem_bytes;
    }
}

struct PlacedTask {
    slave_id: SlaveId,
    resources: Resources,
}

/// A running [`ExecutorRuntime`] and the task it runs on.
struct ExecutorHandle {
    events: mpsc::UnboundedSender<ExecutorEvent>,
    task: JoinHandle<()>,
}

struct FrameworkEntry {
    info: FrameworkInfo,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    executors: HashMap<SlaveId, ExecutorHandle>,
    tasks: HashMap<TaskId, PlacedTask>,
    /// Slaves this framework declined, withheld until the instant given.
    refused: HashMap<SlaveId, Instant>,
}

impl FrameworkEntry {
    fn refuses(&self, slave_id: &SlaveId, now: Instant) -> bool {
        self.refused.get(slave_id).is_some_and(|until| *until > now)
    }
}

struct OutstandingOffer {
    framework_id: FrameworkId,
    slaves: Vec<SlaveId>,
}

struct MasterState {
    next_framework: u64,
    next_offer: u64,
    executors: HashMap<String, Arc<dyn WorkloadFactory>>,
    frameworks: BTreeMap<FrameworkId, FrameworkEntry>,
    slaves: BTreeMap<SlaveId, SlaveEntry>,
    offers: HashMap<OfferId, OutstandingOffer>,
    /// Executors told to shut down whose runtimes may still be winding down.
    retired: Vec<JoinHandle<()>>,
}

impl MasterState {
    fn unmark(&mut self, slaves: &[SlaveId]) {
        for slave_id in slaves {
            if let Some(slave) = self.slaves.get_mut(slave_id) {
                slave.offered = false;
            }
        }
    }

    fn retire(&mut self, executor: ExecutorHandle) {
        let _ = executor.events.send(ExecutorEvent::Shutdown);
        self.retired.retain(|task| !task.is_finished());
        self.retired.push(executor.task);
    }

    /// Drop a framework, returning its resources and offers to the pool.
    fn remove_framework(&mut self, framework_id: &FrameworkId) -> Option<FrameworkEntry> {
        let mut framework = self.frameworks.remove(framework_id)?;

        for task in framework.tasks.values() {
            if let Some(slave) = self.slaves.get_mut(&task.slave_id) {
                slave.release(&task.resources);
            }
        }
        let offer_ids: Vec<OfferId> = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.framework_id == *framework_id)
            .map(|(id, _)| id.clone())
            .collect();
        for offer_id in offer_ids {
            if let Some(offer) = self.offers.remove(&offer_id) {
                self.unmark(&offer.slaves);
            }
        }
        for (_, executor) in framework.executors.drain() {
            self.retire(executor);
        }
        Some(framework)
    }
}

struct MasterInner {
    address: String,
    config: MasterConfig,
    executor_config: ExecutorConfig,
    state: Mutex<MasterState>,
    rotation: Rotation,
    shutdown_tx: watch::Sender<bool>,
}

// ── LocalMaster ─────────────────────────────────────────────────────

/// A master running inside the current process. Cheap to clone.
#[derive(Clone)]
pub struct LocalMaster {
    inner: Arc<MasterInner>,
}

impl LocalMaster {
    pub fn new(config: MasterConfig, executor_config: ExecutorConfig) -> Self {
        let slaves = (0..config.slaves)
            .map(|n| {
                let id = SlaveId::new(format!("{}-slave-{n}", config.address));
                let entry = SlaveEntry {
                    id: id.clone(),
                    free: config.slave_resources(),
                    offered: false,
                };
                (id, entry)
            })
            .collect();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(MasterInner {
                address: config.address.clone(),
                config,
                executor_config,
                state: Mutex::new(MasterState {
                    next_framework: 0,
                    next_offer: 0,
                    executors: HashMap::new(),
                    frameworks: BTreeMap::new(),
                    slaves,
                    offers: HashMap::new(),
                    retired: Vec::new(),
                }),
                rotation: Rotation::new(),
                shutdown_tx,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Make an executor kind available to frameworks on this master.
    pub fn register_executor(&self, uri: impl Into<String>, factory: Arc<dyn WorkloadFactory>) {
        let uri = uri.into();
        debug!(master = %self.inner.address, %uri, "executor registered");
        self.inner.lock().executors.insert(uri, factory);
    }

    /// Start making offers every `offer_interval`.
    pub fn start(&self) -> JoinHandle<()> {
        let master = Arc::downgrade(&self.inner);
        let interval = self.inner.config.offer_interval();
        let shutdown = self.inner.shutdown_tx.subscribe();
        info!(
            master = %self.inner.address,
            slaves = self.inner.config.slaves,
            ?interval,
            "master started"
        );
        tokio::spawn(offer_loop(master, interval, shutdown))
    }

    /// Register a framework. The outcome arrives as the first event on the
    /// returned channel.
    pub fn connect(&self, framework: FrameworkInfo) -> Connection {
        self.inner.connect(framework)
    }

    /// Run one offer round now. Returns how many slaves were offered.
    pub fn offer_round(&self) -> usize {
        self.inner.offer_round()
    }

    /// Take a slave out of service, as if it had crashed.
    ///
    /// Outstanding offers that include it are rescinded, its executors are
    /// shut down and every framework is told the slave is lost.
    pub fn lose_slave(&self, slave_id: &SlaveId) -> bool {
        self.inner.lose_slave(slave_id)
    }

    pub fn frameworks(&self) -> Vec<FrameworkId> {
        self.inner.lock().frameworks.keys().cloned().collect()
    }

    pub fn slaves(&self) -> Vec<SlaveId> {
        self.inner.lock().slaves.keys().cloned().collect()
    }

    pub fn free_resources(&self, slave_id: &SlaveId) -> Option<Resources> {
        self.inner.lock().slaves.get(slave_id).map(|s| s.free)
    }

    /// Tasks the master believes are still placed for a framework.
    pub fn placed_tasks(&self, framework_id: &FrameworkId) -> usize {
        self.inner
            .lock()
            .frameworks
            .get(framework_id)
            .map_or(0, |f| f.tasks.len())
    }

    /// Stop offering, drop every framework and wait for every executor
    /// runtime to kill its tasks and exit.
    ///
    /// Schedulers see their event stream end. Later registrations are
    /// refused. An `Inline` executor only sees the shutdown once its
    /// current workload returns.
    pub async fn shutdown(&self) {
        join_executors(self.close()).await;
    }

    /// The synchronous half of [`shutdown`](Self::shutdown). Returns the
    /// executor tasks still to be awaited.
    pub(crate) fn close(&self) -> Vec<JoinHandle<()>> {
        self.inner.shutdown_tx.send_replace(true);
        let mut state = self.inner.lock();
        let ids: Vec<FrameworkId> = state.frameworks.keys().cloned().collect();
        for framework_id in &ids {
            state.remove_framework(framework_id);
        }
        state.executors.clear();
        info!(master = %self.inner.address, frameworks = ids.len(), "master shut down");
        std::mem::take(&mut state.retired)
    }
}

/// Await executor runtimes that were told to shut down.
pub(crate) async fn join_executors(executors: Vec<JoinHandle<()>>) {
    let count = executors.len();
    for task in executors {
        if let Err(e) = task.await {
            warn!(error = %e, "executor task ended abnormally");
        }
    }
    debug!(executors = count, "executors joined");
}

async fn offer_loop(
    master: Weak<MasterInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow_and_update() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(master) = master.upgrade() else { break };
                master.offer_round();
            }
            _ = shutdown.changed() => {
                debug!("offer loop shutting down");
                break;
            }
        }
    }
}

impl MasterInner {
    fn lock(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(self: &Arc<Self>, framework: FrameworkInfo) -> Connection {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let refusal = if *self.shutdown_tx.borrow() {
            Some("master shut down".to_string())
        } else if !state.executors.contains_key(&framework.executor.uri) {
            Some(format!("unknown executor: {}", framework.executor.uri))
        } else {
            None
        };

        let framework_id = if let Some(message) = refusal {
            warn!(
                master = %self.address,
                name = %framework.name,
                executor = %framework.executor.uri,
                %message,
                "registration refused"
            );
            let _ = events_tx.send(SchedulerEvent::Error {
                code: REGISTRATION_REFUSED,
                message,
            });
            FrameworkId::new(format!("{}-refused", self.address))
        } else {
            state.next_framework += 1;
            let framework_id = FrameworkId::new(format!("{}-{}", self.address, state.next_framework));
            info!(
                master = %self.address,
                %framework_id,
                name = %framework.name,
                executor = %framework.executor.uri,
                "framework registered"
            );
            let _ = events_tx.send(SchedulerEvent::Registered(framework_id.clone()));
            state.frameworks.insert(
                framework_id.clone(),
                FrameworkEntry {
                    info: framework,
                    events: events_tx,
                    executors: HashMap::new(),
                    tasks: HashMap::new(),
                    refused: HashMap::new(),
                },
            );
            framework_id
        };

        Connection {
            driver: Arc::new(LocalSchedulerDriver {
                master: Arc::clone(self),
                framework_id,
            }),
            events: events_rx,
        }
    }

    fn offer_round(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let ids: Vec<FrameworkId> = state.frameworks.keys().cloned().collect();
        let now = Instant::now();

        for idx in self.rotation.order(ids.len()) {
            let framework_id = &ids[idx];
            let Some(framework) = state.frameworks.get(framework_id) else {
                continue;
            };
            let offers: Vec<Offer> = state
                .slaves
                .values()
                .filter(|slave| slave.offerable() && !framework.refuses(&slave.id, now))
                .map(SlaveEntry::offer)
                .collect();
            if offers.is_empty() {
                continue;
            }

            state.next_offer += 1;
            let offer_id = OfferId::new(format!("{}-offer-{}", self.address, state.next_offer));
            let slaves: Vec<SlaveId> = offers.iter().map(|o| o.slave_id.clone()).collect();
            let count = slaves.len();
            debug!(master = %self.address, %framework_id, %offer_id, slaves = count, "offering");

            let delivered = framework
                .events
                .send(SchedulerEvent::ResourceOffer {
                    offer_id: offer_id.clone(),
                    offers,
                })
                .is_ok();
            if !delivered {
                warn!(%framework_id, "scheduler went away, removing framework");
                state.remove_framework(framework_id);
                continue;
            }

            for slave_id in &slaves {
                if let Some(slave) = state.slaves.get_mut(slave_id) {
                    slave.offered = true;
                }
            }
            state.offers.insert(
                offer_id,
                OutstandingOffer {
                    framework_id: framework_id.clone(),
                    slaves,
                },
            );
            return count;
        }
        0
    }

    fn reply_to_offer(
        self: &Arc<Self>,
        framework_id: &FrameworkId,
        offer_id: &OfferId,
        tasks: Vec<TaskDescription>,
        params: HashMap<String, String>,
    ) -> DriverResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let offer = match state.offers.remove(offer_id) {
            Some(offer) if offer.framework_id == *framework_id => offer,
            Some(offer) => {
                state.offers.insert(offer_id.clone(), offer);
                return Err(DriverError::UnknownOffer(offer_id.clone()));
            }
            None => return Err(DriverError::UnknownOffer(offer_id.clone())),
        };
        state.unmark(&offer.slaves);

        let Some(framework) = state.frameworks.get_mut(framework_id) else {
            return Err(DriverError::NotRegistered(framework_id.clone()));
        };
        let factory = state.executors.get(&framework.info.executor.uri).cloned();
        let refuse = params
            .get(REFUSE_SECONDS)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let mut used = HashSet::new();
        for task in tasks {
            let task_id = task.task_id;
            let slave_id = task.slave_id.clone();
            let fits = state
                .slaves
                .get(&slave_id)
                .is_some_and(|slave| slave.free.covers(&task.resources));

            let factory = match &factory {
                Some(factory) if offer.slaves.contains(&slave_id) && fits => Arc::clone(factory),
                _ => {
                    let reason = if !offer.slaves.contains(&slave_id) {
                        "slave not part of offer"
                    } else if !fits {
                        "insufficient resources"
                    } else {
                        "executor not registered"
                    };
                    warn!(%framework_id, %task_id, %slave_id, reason, "task not launched");
                    let _ = framework.events.send(SchedulerEvent::StatusUpdate(
                        TaskStatus::new(task_id, TaskState::Lost).with_message(reason),
                    ));
                    continue;
                }
            };

            if let Some(slave) = state.slaves.get_mut(&slave_id) {
                slave.claim(&task.resources);
            }
            framework.tasks.insert(
                task_id,
                PlacedTask {
                    slave_id: slave_id.clone(),
                    resources: task.resources,
                },
            );
            used.insert(slave_id.clone());

            if framework
                .executors
                .get(&slave_id)
                .is_some_and(|executor| executor.events.is_closed())
            {
                if let Some(stale) = framework.executors.remove(&slave_id) {
                    state.retired.push(stale.task);
                }
            }
            let executor = framework
                .executors
                .entry(slave_id.clone())
                .or_insert_with(|| self.spawn_executor(framework_id, &slave_id, factory));

            debug!(%framework_id, %task_id, %slave_id, name = %task.name, "launching task");
            let _ = executor.events.send(ExecutorEvent::Launch(task));
        }

        if refuse > 0 {
            let until = Instant::now() + Duration::from_secs(refuse);
            for slave_id in offer.slaves.iter().filter(|s| !used.contains(*s)) {
                framework.refused.insert(slave_id.clone(), until);
            }
        }
        Ok(())
    }

    fn spawn_executor(
        self: &Arc<Self>,
        framework_id: &FrameworkId,
        slave_id: &SlaveId,
        factory: Arc<dyn WorkloadFactory>,
    ) -> ExecutorHandle {
        let driver = Arc::new(LocalExecutorDriver {
            master: Arc::downgrade(self),
            framework_id: framework_id.clone(),
            slave_id: slave_id.clone(),
        });
        let runtime = ExecutorRuntime::new(driver, factory, self.executor_config.clone());
        let (events, task) = runtime.spawn();
        info!(%framework_id, %slave_id, "executor started");
        ExecutorHandle { events, task }
    }

    fn kill_task(&self, framework_id: &FrameworkId, task_id: TaskId) -> DriverResult<()> {
        let state = self.lock();
        let framework = state
            .frameworks
            .get(framework_id)
            .ok_or_else(|| DriverError::NotRegistered(framework_id.clone()))?;

        match framework
            .tasks
            .get(&task_id)
            .and_then(|task| framework.executors.get(&task.slave_id))
        {
            Some(executor) => {
                let _ = executor.events.send(ExecutorEvent::Kill(task_id));
            }
            None => debug!(%framework_id, %task_id, "kill for task with no executor ignored"),
        }
        Ok(())
    }

    fn unregister(&self, framework_id: &FrameworkId) -> DriverResult<()> {
        let mut state = self.lock();
        match state.remove_framework(framework_id) {
            Some(framework) => {
                info!(%framework_id, name = %framework.info.name, "framework unregistered");
                Ok(())
            }
            None => Err(DriverError::NotRegistered(framework_id.clone())),
        }
    }

    fn status_update(
        &self,
        framework_id: &FrameworkId,
        slave_id: &SlaveId,
        status: TaskStatus,
    ) -> DriverResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(framework) = state.frameworks.get_mut(framework_id) else {
            debug!(%framework_id, task_id = %status.task_id, "status for departed framework dropped");
            return Ok(());
        };
        if !framework.tasks.contains_key(&status.task_id) {
            debug!(%framework_id, task_id = %status.task_id, state = %status.state, "status for unknown task dropped");
            return Ok(());
        }
        if status.state.is_terminal() {
            if let Some(task) = framework.tasks.remove(&status.task_id) {
                if let Some(slave) = state.slaves.get_mut(&task.slave_id) {
                    slave.release(&task.resources);
                }
            }
        }

        debug!(%framework_id, %slave_id, task_id = %status.task_id, state = %status.state, "status update");
        framework
            .events
            .send(SchedulerEvent::StatusUpdate(status))
            .map_err(|_| DriverError::Disconnected)
    }

    fn lose_slave(&self, slave_id: &SlaveId) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.slaves.remove(slave_id).is_none() {
            return false;
        }

        let rescinded: Vec<OfferId> = state
            .offers
            .iter()
            .filter(|(_, offer)| offer.slaves.contains(slave_id))
            .map(|(id, _)| id.clone())
            .collect();
        for offer_id in rescinded {
            if let Some(offer) = state.offers.remove(&offer_id) {
                state.unmark(&offer.slaves);
                if let Some(framework) = state.frameworks.get(&offer.framework_id) {
                    let _ = framework.events.send(SchedulerEvent::OfferRescinded(offer_id));
                }
            }
        }

        let mut lost_executors = Vec::new();
        for framework in state.frameworks.values_mut() {
            framework.tasks.retain(|_, task| task.slave_id != *slave_id);
            framework.refused.remove(slave_id);
            lost_executors.extend(framework.executors.remove(slave_id));
            let _ = framework
                .events
                .send(SchedulerEvent::SlaveLost(slave_id.clone()));
        }
        for executor in lost_executors {
            state.retire(executor);
        }
        warn!(master = %self.address, %slave_id, "slave lost");
        true
    }
}

// ── Drivers ─────────────────────────────────────────────────────────

/// Scheduler-side handle onto a [`LocalMaster`] for one framework.
struct LocalSchedulerDriver {
    master: Arc<MasterInner>,
    framework_id: FrameworkId,
}

impl SchedulerDriver for LocalSchedulerDriver {
    fn reply_to_offer(
        &self,
        offer_id: &OfferId,
        tasks: Vec<TaskDescription>,
        params: HashMap<String, String>,
    ) -> DriverResult<()> {
        self.master
            .reply_to_offer(&self.framework_id, offer_id, tasks, params)
    }

    fn kill_task(&self, task_id: TaskId) -> DriverResult<()> {
        self.master.kill_task(&self.framework_id, task_id)
    }

    fn stop(&self) -> DriverResult<()> {
        self.master.unregister(&self.framework_id)
    }
}

/// Executor-side handle onto a [`LocalMaster`].
struct LocalExecutorDriver {
    master: Weak<MasterInner>,
    framework_id: FrameworkId,
    slave_id: SlaveId,
}

impl ExecutorDriver for LocalExecutorDriver {
    fn send_status_update(&self, status: TaskStatus) -> DriverResult<()> {
        let master = self.master.upgrade().ok_or(DriverError::Disconnected)?;
        master.status_update(&self.framework_id, &self.slave_id, status)
    }
}
