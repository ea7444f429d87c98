//! hopflow CLI entry point.
//!
//! Binary name: `hopflow`
//!
//! Parses CLI arguments, sets up tracing, wires the engine over the SQLite
//! store, then dispatches to the command handler.

mod cli;
mod state;
mod workflows;

use clap::Parser;
use hopflow_observe::tracing_setup::{LogFormat, filter_for_verbosity, init_tracing, shutdown_tracing};

use cli::{Cli, Commands, ExecutionCommand, OutboxCommand, SweepCommand};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    init_tracing(filter_for_verbosity(cli.verbose, cli.quiet), format, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(cli.config, cli.database).await?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Run { duration_secs } => cli::run::run(&state, duration_secs, json).await,

        Commands::Start {
            topic,
            payload,
            wait_secs,
        } => cli::run::start(&state, &topic, &payload, wait_secs, json).await,

        Commands::Workflows => cli::run::list_workflows(&state, json).await,

        Commands::Executions { action } => match action {
            ExecutionCommand::List {
                status,
                topic,
                limit,
            } => cli::execution::list_executions(&state, status, topic, limit, json).await,
            ExecutionCommand::Show { execution_id } => {
                cli::execution::show_execution(&state, &execution_id, json).await
            }
            ExecutionCommand::Resume {
                execution_id,
                from_step,
                by,
                wait_secs,
            } => {
                cli::execution::resume_execution(&state, &execution_id, from_step, &by, wait_secs, json)
                    .await
            }
            ExecutionCommand::Cancel { execution_id } => {
                cli::execution::cancel_execution(&state, &execution_id, json).await
            }
            ExecutionCommand::SetField {
                execution_id,
                path,
                value,
                by,
                reason,
            } => {
                cli::execution::set_field(&state, &execution_id, &path, &value, &by, reason, json)
                    .await
            }
            ExecutionCommand::RestorePayload { execution_id } => {
                cli::execution::restore_payload(&state, &execution_id, json).await
            }
        },

        Commands::Sweep { action } => match action {
            SweepCommand::Retries { wait_secs } => {
                cli::maintenance::sweep_retries(&state, wait_secs, json).await
            }
            SweepCommand::Cleanup => cli::maintenance::sweep_cleanup(&state, json).await,
        },

        Commands::Outbox { action } => match action {
            OutboxCommand::Relay { wait_secs } => {
                cli::maintenance::relay_outbox(&state, wait_secs, json).await
            }
            OutboxCommand::Stats => cli::maintenance::outbox_stats(&state, json).await,
            OutboxCommand::Cleanup => cli::maintenance::outbox_cleanup(&state, json).await,
        },

        Commands::Config => cli::run::show_config(&state, json),
    };

    state.runtime.shutdown().await;
    result
}
