//! `slotd run`: one framework session on a local cluster.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::{info, warn};

use slot_core::codec::{self, SleepPayload};
use slot_core::config::NestedConfig;
use slot_core::{ExecutorInfo, FrameworkInfo, MasterConnector, SlotConfig, TaskSpec, Todo};
use slotgrid_executor::SCALING_EXECUTOR;
use slotgrid_local::LocalCluster;
use slotgrid_scheduler::{SchedulerCore, SessionReport};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to slotd.toml. Built-in defaults are used without it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Master address to register the framework with.
    #[arg(long)]
    pub master: Option<String>,

    /// Number of tasks to run; -1 runs until interrupted.
    #[arg(long, allow_hyphen_values = true)]
    pub todo: Option<i64>,

    /// How long each task sleeps.
    #[arg(long)]
    pub duration_ms: Option<u64>,

    /// Executor uri to launch tasks with (`sleep` or `scaling`).
    #[arg(long)]
    pub executor: Option<String>,

    /// Turn every task into a nested session on this master.
    #[arg(long)]
    pub nested_master: Option<String>,

    /// Tasks per nested session; -1 runs until the parent task is killed.
    #[arg(long, allow_hyphen_values = true)]
    pub nested_todo: Option<i64>,

    /// How long each nested task sleeps.
    #[arg(long)]
    pub nested_duration_ms: Option<u64>,
}

impl RunArgs {
    /// Load the config file (if any) and apply flag overrides on top.
    pub fn resolve(&self) -> anyhow::Result<SlotConfig> {
        let mut config = match &self.config {
            Some(path) => SlotConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SlotConfig::default(),
        };

        if let Some(master) = &self.master {
            config.framework.master = master.clone();
        }
        if let Some(todo) = self.todo {
            config.framework.todo = Todo::try_from(todo)?;
        }
        if let Some(duration_ms) = self.duration_ms {
            config.framework.duration_ms = duration_ms;
        }
        if let Some(executor) = &self.executor {
            config.framework.executor = executor.clone();
        }

        if self.nested_master.is_some()
            || self.nested_todo.is_some()
            || self.nested_duration_ms.is_some()
        {
            let nested = config.nested.get_or_insert_with(NestedConfig::default);
            if let Some(master) = &self.nested_master {
                nested.master = master.clone();
            }
            if let Some(todo) = self.nested_todo {
                nested.todo = Todo::try_from(todo)?;
            }
            if let Some(duration_ms) = self.nested_duration_ms {
                nested.duration_ms = duration_ms;
            }
            if self.executor.is_none() {
                config.framework.executor = SCALING_EXECUTOR.to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }
}

/// The task every top-level offer is answered with.
pub fn task_template(config: &SlotConfig) -> anyhow::Result<TaskSpec> {
    let framework = &config.framework;
    let payload = if framework.executor == SCALING_EXECUTOR {
        let nested = config.nested.clone().unwrap_or_default();
        codec::encode(&nested.payload())?
    } else {
        codec::encode(&SleepPayload::new(framework.duration()))?
    };
    Ok(TaskSpec {
        name: framework.executor.clone(),
        resources: framework.task_resources(),
        payload,
    })
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    info!(
        master = %config.framework.master,
        executor = %config.framework.executor,
        todo = %config.framework.todo,
        duration_ms = config.framework.duration_ms,
        "slotd starting"
    );

    let cluster = LocalCluster::from_config(&config);
    cluster.start();
    info!(masters = ?cluster.addresses(), "local cluster started");

    let result = run_session(&cluster, &config).await;
    // Executors get to kill their tasks before the process exits.
    cluster.shutdown().await;

    let report = result?;
    info!(
        framework_id = ?report.framework_id,
        launched = report.launched,
        finished = report.finished,
        failed = report.failed,
        reason = ?report.reason,
        "slotd stopped"
    );
    println!(
        "launched {} finished {} failed {} ({:?})",
        report.launched, report.finished, report.failed, report.reason
    );
    Ok(())
}

async fn run_session(cluster: &LocalCluster, config: &SlotConfig) -> anyhow::Result<SessionReport> {
    let framework = FrameworkInfo {
        name: config.framework.name.clone(),
        executor: ExecutorInfo::new(config.framework.executor.as_str()),
    };
    let template = task_template(config)?;
    let connection = cluster
        .connect(&config.framework.master, framework.clone())
        .with_context(|| format!("connecting to master {}", config.framework.master))?;

    let session = SchedulerCore::for_todo(
        framework,
        connection.driver,
        config.framework.todo,
        template,
    )
    .with_refuse_seconds(config.framework.refuse_seconds)
    .spawn(connection.events);

    // Ctrl-C stops the session, which kills every task still running.
    let stop = session.stop_handle();
    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                stop.stop();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    let report = session.join().await;
    signal.abort();
    Ok(report?)
}
