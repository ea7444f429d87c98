//! Application state wiring the engine for the CLI.
//!
//! The engine services are generic over the execution store; AppState pins
//! them to the SQLite store so executions survive between invocations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hopflow_core::repository::execution::ExecutionRepository;
use hopflow_infra::config::{default_config_path, load_engine_config};
use hopflow_infra::runtime::{EngineRuntime, EngineRuntimeBuilder};
use hopflow_infra::sqlite::execution::SqliteExecutionStore;
use hopflow_infra::sqlite::pool::{DatabasePool, data_dir, default_database_url};
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::status::WorkflowStatus;

use crate::workflows;

pub type ConcreteRuntime = EngineRuntime<SqliteExecutionStore>;

/// Shared state for every CLI command.
pub struct AppState {
    pub runtime: ConcreteRuntime,
    pub config_path: PathBuf,
    pub database_url: String,
}

impl AppState {
    /// Load config, open the database, and wire the engine. Nothing runs
    /// until [`AppState::start`].
    pub async fn init(config: Option<PathBuf>, database: Option<String>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir()).await?;

        let config_path = config.unwrap_or_else(default_config_path);
        let engine_config = load_engine_config(&config_path).await;

        let database_url = database.unwrap_or_else(default_database_url);
        let pool = DatabasePool::new(&database_url).await?;
        let store = Arc::new(SqliteExecutionStore::new(pool));

        let builder = workflows::register(EngineRuntimeBuilder::new(engine_config))?;
        let runtime = builder.build(store);

        Ok(Self {
            runtime,
            config_path,
            database_url,
        })
    }

    /// Start broker delivery and the background sweeps.
    pub fn start(&self) -> anyhow::Result<()> {
        self.runtime.start()?;
        Ok(())
    }

    /// Start broker delivery without the background sweeps.
    pub fn start_delivery(&self) -> anyhow::Result<()> {
        self.runtime.start_delivery()?;
        Ok(())
    }

    /// Poll until the execution moves past `since_version` and is no longer
    /// pending or in progress. Returns the last observed state on timeout.
    pub async fn wait_until_settled(
        &self,
        execution_id: &str,
        since_version: Option<u64>,
        timeout: Duration,
    ) -> anyhow::Result<Option<WorkflowExecution>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.runtime.store().find_by_id(execution_id).await?;
            if let Some(exec) = &current {
                let advanced = match (since_version, exec.version) {
                    (Some(since), Some(now)) => now > since,
                    _ => true,
                };
                if advanced && !is_moving(exec.status) {
                    return Ok(current);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(current);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Statuses that change without operator action.
fn is_moving(status: WorkflowStatus) -> bool {
    matches!(status, WorkflowStatus::Pending | WorkflowStatus::InProgress)
}
