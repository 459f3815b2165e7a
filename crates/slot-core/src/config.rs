//! slotd.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::NestedPayload;
use crate::types::{Resources, Todo};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    pub framework: FrameworkConfig,
    pub executor: ExecutorConfig,
    pub nested: Option<NestedConfig>,
    pub masters: Vec<MasterConfig>,
}

/// The top-level framework `slotd run` registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub name: String,
    /// Address of the master to register with.
    pub master: String,
    /// Executor uri started on slaves for this framework's tasks.
    pub executor: String,
    pub todo: Todo,
    pub duration_ms: u64,
    pub task_cpus: f64,
    pub task_mem_bytes: u64,
    pub refuse_seconds: u64,
}

/// How executors run their workloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    /// How long a kill waits for a workload to wind down before aborting it.
    pub kill_grace_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Workload runs on its own task; the executor keeps handling events.
    #[default]
    Worker,
    /// The event handler awaits the workload. Kills queue up behind it.
    Inline,
}

/// Turns every top-level task into a nested session against `master`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedConfig {
    pub master: String,
    pub todo: Todo,
    pub duration_ms: u64,
    /// Executor uri the nested sessions launch their tasks with.
    pub executor: String,
    /// One more level of nesting below this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<NestedConfig>>,
}

/// One in-process master and its slaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub address: String,
    pub slaves: u32,
    pub slave_cpus: f64,
    pub slave_mem_bytes: u64,
    pub offer_interval_ms: u64,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            name: "slotgrid framework".to_string(),
            master: "local".to_string(),
            executor: "sleep".to_string(),
            todo: Todo::Bounded(5),
            duration_ms: 1000,
            task_cpus: 1.0,
            task_mem_bytes: 128 * 1024 * 1024,
            refuse_seconds: 1,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Worker,
            kill_grace_ms: 5000,
        }
    }
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            master: "nested".to_string(),
            todo: Todo::Bounded(5),
            duration_ms: 1000,
            executor: "sleep".to_string(),
            next: None,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: "local".to_string(),
            slaves: 4,
            slave_cpus: 2.0,
            slave_mem_bytes: 1024 * 1024 * 1024,
            offer_interval_ms: 100,
        }
    }
}

impl FrameworkConfig {
    pub fn task_resources(&self) -> Resources {
        Resources::new(self.task_cpus, self.task_mem_bytes)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl ExecutorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl NestedConfig {
    /// The payload a top-level scaling task carries for this level and
    /// every level below it.
    pub fn payload(&self) -> NestedPayload {
        NestedPayload {
            master: self.master.clone(),
            todo: self.todo,
            duration_ms: self.duration_ms,
            next: self.next.as_ref().map(|next| Box::new(next.payload())),
        }
    }

    /// This level followed by every level below it.
    pub fn levels(&self) -> impl Iterator<Item = &NestedConfig> {
        std::iter::successors(Some(self), |level| level.next.as_deref())
    }
}

impl MasterConfig {
    pub fn slave_resources(&self) -> Resources {
        Resources::new(self.slave_cpus, self.slave_mem_bytes)
    }

    pub fn offer_interval(&self) -> Duration {
        Duration::from_millis(self.offer_interval_ms)
    }
}

impl SlotConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SlotConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations that can never make progress.
    pub fn validate(&self) -> anyhow::Result<()> {
        for master in &self.masters {
            if master.slaves == 0 {
                anyhow::bail!("master {} has no slaves", master.address);
            }
            if master.offer_interval_ms == 0 {
                anyhow::bail!("master {} has a zero offer interval", master.address);
            }
        }
        if !self.framework.task_cpus.is_finite() || self.framework.task_cpus < 0.0 {
            anyhow::bail!("task_cpus must be a non-negative number");
        }
        for level in self.nested.iter().flat_map(NestedConfig::levels) {
            if level.executor == "scaling" && level.next.is_none() {
                anyhow::bail!(
                    "nested level on {} uses the scaling executor but has no next level",
                    level.master
                );
            }
        }
        Ok(())
    }

    /// Masters to start, falling back to one default master per address
    /// the framework and nested config refer to.
    pub fn effective_masters(&self) -> Vec<MasterConfig> {
        if !self.masters.is_empty() {
            return self.masters.clone();
        }
        let mut masters = vec![MasterConfig {
            address: self.framework.master.clone(),
            ..MasterConfig::default()
        }];
        for level in self.nested.iter().flat_map(NestedConfig::levels) {
            if masters.iter().all(|m| m.address != level.master) {
                masters.push(MasterConfig {
                    address: level.master.clone(),
                    ..MasterConfig::default()
                });
            }
        }
        masters
    }

    /// Scaffold a slotd.toml with one nested level.
    pub fn scaffold() -> Self {
        SlotConfig {
            framework: FrameworkConfig {
                executor: "scaling".to_string(),
                todo: Todo::Bounded(2),
                ..FrameworkConfig::default()
            },
            executor: ExecutorConfig::default(),
            nested: Some(NestedConfig::default()),
            masters: vec![
                MasterConfig::default(),
                MasterConfig {
                    address: "nested".to_string(),
                    ..MasterConfig::default()
                },
            ],
        }
    }
}
