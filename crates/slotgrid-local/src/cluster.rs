//! Address book of in-process masters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use slot_core::config::NestedConfig;
use slot_core::{
    Connection, DriverError, DriverResult, FrameworkInfo, MasterConnector, Resources, SlotConfig,
};
use slotgrid_executor::{
    NestedWorkloadFactory, SleepWorkloadFactory, WorkloadFactory, SCALING_EXECUTOR,
    SLEEP_EXECUTOR,
};

use crate::master::{join_executors, LocalMaster};

/// Resolves master addresses to [`LocalMaster`]s. Cheap to clone.
///
/// The nested executor holds a clone of the cluster to reach other
/// masters, so call [`shutdown`](Self::shutdown) when done to release them.
#[derive(Clone, Default)]
pub struct LocalCluster {
    masters: Arc<Mutex<HashMap<String, LocalMaster>>>,
    /// Executors of replaced masters, joined on shutdown.
    retired: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one master per configured address and register the built-in
    /// executors on all of them. Offer loops are not started yet.
    pub fn from_config(config: &SlotConfig) -> Self {
        let cluster = Self::new();
        for master in config.effective_masters() {
            cluster.add_master(LocalMaster::new(master, config.executor.clone()));
        }
        let nested = config.nested.clone().unwrap_or_default();
        cluster.register_builtin_executors(&nested, config.framework.task_resources());
        cluster
    }

    /// Add a master, replacing any previous one at the same address.
    pub fn add_master(&self, master: LocalMaster) {
        let address = master.address().to_string();
        let replaced = self.lock().insert(address.clone(), master);
        if let Some(old) = replaced {
            warn!(%address, "replacing master");
            let executors = old.close();
            self.retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(executors);
        }
    }

    pub fn master(&self, address: &str) -> Option<LocalMaster> {
        self.lock().get(address).cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Register an executor kind on every master added so far.
    pub fn register_executor(&self, uri: &str, factory: Arc<dyn WorkloadFactory>) {
        for master in self.lock().values() {
            master.register_executor(uri, Arc::clone(&factory));
        }
    }

    /// Register `sleep` and `scaling` on every master.
    ///
    /// `scaling` tasks open a child session on another master of this
    /// cluster; the child framework asks for `nested.executor`.
    pub fn register_builtin_executors(&self, nested: &NestedConfig, task_resources: Resources) {
        self.register_executor(SLEEP_EXECUTOR, Arc::new(SleepWorkloadFactory));
        let scaling = NestedWorkloadFactory::new(Arc::new(self.clone()))
            .with_executor(nested.executor.as_str())
            .with_task_resources(task_resources);
        self.register_executor(SCALING_EXECUTOR, Arc::new(scaling));
    }

    /// Start every master's offer loop.
    pub fn start(&self) {
        for master in self.lock().values() {
            master.start();
        }
    }

    /// Shut down and forget every master, then wait for every executor
    /// runtime to kill its tasks and exit.
    ///
    /// All masters close before any executor is awaited, so nested sessions
    /// torn down meanwhile find their masters already gone.
    pub async fn shutdown(&self) {
        let masters: Vec<LocalMaster> = self.lock().drain().map(|(_, m)| m).collect();
        let mut executors: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.retired.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for master in &masters {
            executors.extend(master.close());
        }
        join_executors(executors).await;
        info!(masters = masters.len(), "local cluster shut down");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LocalMaster>> {
        self.masters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MasterConnector for LocalCluster {
    fn connect(&self, address: &str, framework: FrameworkInfo) -> DriverResult<Connection> {
        let master = self
            .master(address)
            .ok_or_else(|| DriverError::UnknownMaster(address.to_string()))?;
        Ok(master.connect(framework))
    }
}

#[cfg(test)]
mod tests {
    use slot_core::config::{ExecutorConfig, MasterConfig};
    use slot_core::{ExecutorInfo, SchedulerEvent};

    use super::*;

    fn framework() -> FrameworkInfo {
        FrameworkInfo {
            name: "t".to_string(),
            executor: ExecutorInfo::new(SLEEP_EXECUTOR),
        }
    }

    #[tokio::test]
    async fn from_config_builds_every_master() {
        let cluster = LocalCluster::from_config(&SlotConfig::scaffold());
        assert_eq!(cluster.addresses(), vec!["local".to_string(), "nested".to_string()]);
        cluster.shutdown().await;
        assert!(cluster.addresses().is_empty());
    }

    #[test]
    fn unknown_address_is_rejected() {
        let cluster = LocalCluster::new();
        let result = cluster.connect("nowhere", framework());
        assert!(matches!(result, Err(DriverError::UnknownMaster(_))));
    }

    #[tokio::test]
    async fn connect_routes_to_master() {
        let cluster = LocalCluster::new();
        cluster.add_master(LocalMaster::new(
            MasterConfig {
                address: "a".to_string(),
                ..MasterConfig::default()
            },
            ExecutorConfig::default(),
        ));
        cluster.register_builtin_executors(&NestedConfig::default(), Resources::default());

        let mut conn = cluster.connect("a", framework()).unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(
            conn.events.recv().await,
            Some(SchedulerEvent::Registered(id)) if id.as_str() == "a-1"
        ));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn replaced_master_refuses_old_clients() {
        let cluster = LocalCluster::new();
        let config = MasterConfig {
            address: "a".to_string(),
            ..MasterConfig::default()
        };
        let old = LocalMaster::new(config.clone(), ExecutorConfig::default());
        cluster.add_master(old.clone());
        cluster.add_master(LocalMaster::new(config, ExecutorConfig::default()));
        cluster.register_builtin_executors(&NestedConfig::default(), Resources::default());

        let mut conn = old.connect(framework());
        assert!(matches!(conn.events.recv().await, Some(SchedulerEvent::Error { .. })));
        assert_eq!(cluster.addresses(), vec!["a".to_string()]);
        cluster.shutdown().await;
    }
}
