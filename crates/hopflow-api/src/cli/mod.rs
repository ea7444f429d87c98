//! CLI command definitions for the `hopflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! what they act on (`hopflow executions resume`, `hopflow outbox stats`).

pub mod execution;
pub mod maintenance;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and operate step-by-step workflows over a message broker.
#[derive(Parser)]
#[command(name = "hopflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine configuration file (default: ~/.hopflow/hopflow.toml).
    #[arg(long, global = true, env = "HOPFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database URL (default: ~/.hopflow/hopflow.db).
    #[arg(long, global = true, env = "HOPFLOW_DATABASE_URL")]
    pub database: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: deliver messages, sweep retries, relay the outbox.
    Run {
        /// Stop after this many seconds (default: until Ctrl-C).
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Start a new workflow execution.
    Start {
        /// Workflow topic.
        topic: String,

        /// Initial payload as JSON.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Seconds to wait for the execution to settle.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// List registered workflows.
    Workflows,

    /// Inspect and operate on executions.
    #[command(alias = "exec")]
    Executions {
        #[command(subcommand)]
        action: ExecutionCommand,
    },

    /// Run a scheduler sweep once.
    Sweep {
        #[command(subcommand)]
        action: SweepCommand,
    },

    /// Inspect and drain the transactional outbox.
    Outbox {
        #[command(subcommand)]
        action: OutboxCommand,
    },

    /// Print the effective engine configuration as TOML.
    Config,
}

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// List executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (e.g. failed, retry-pending).
        #[arg(long)]
        status: Option<String>,

        /// Filter by workflow topic.
        #[arg(long)]
        topic: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one execution with its step history and attempts.
    Show { execution_id: String },

    /// Resume a failed, paused, or retry-pending execution.
    Resume {
        execution_id: String,

        /// Step to resume from (default: the current step).
        #[arg(long)]
        from_step: Option<u32>,

        /// Operator recorded on the new attempt.
        #[arg(long, default_value = "cli")]
        by: String,

        /// Seconds to wait for the execution to settle.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Cancel an execution.
    Cancel { execution_id: String },

    /// Change one payload field (dot path, e.g. `address.city`).
    #[command(name = "set-field")]
    SetField {
        execution_id: String,
        path: String,

        /// New value; parsed as JSON, otherwise taken as a string.
        value: String,

        #[arg(long, default_value = "cli")]
        by: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Undo every payload change made in the current attempt.
    #[command(name = "restore-payload")]
    RestorePayload { execution_id: String },
}

#[derive(Subcommand)]
pub enum SweepCommand {
    /// Resubmit due retries.
    Retries {
        /// Seconds to wait for resubmitted executions to settle.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Delete completed and failed executions past retention.
    Cleanup,
}

#[derive(Subcommand)]
pub enum OutboxCommand {
    /// Send ready outbox messages once.
    Relay {
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Count outbox messages by status.
    Stats,

    /// Delete sent messages past retention.
    Cleanup,
}

/// Parse an operator-supplied value: JSON when it parses, otherwise a string.
pub fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Format a datetime as relative time (e.g., "2m ago", "3h ago").
pub fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let diff = now - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_value_prefers_json() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("{\"a\":true}"), json!({"a": true}));
        assert_eq!(parse_value("Berlin"), json!("Berlin"));
    }

    #[test]
    fn test_set_field_arguments() {
        let cli = Cli::try_parse_from([
            "hopflow", "executions", "set-field", "exec-1", "address.city", "Berlin", "--reason", "typo",
        ])
        .unwrap();
        match cli.command {
            Commands::Executions {
                action: ExecutionCommand::SetField { path, value, by, reason, .. },
            } => {
                assert_eq!(path, "address.city");
                assert_eq!(value, "Berlin");
                assert_eq!(by, "cli");
                assert_eq!(reason.as_deref(), Some("typo"));
            }
            _ => panic!("expected set-field"),
        }
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now();
        assert_eq!(format_relative_time(&now), "just now");
        assert_eq!(format_relative_time(&(now - chrono::Duration::minutes(5))), "5m ago");
        assert_eq!(format_relative_time(&(now - chrono::Duration::hours(3))), "3h ago");
    }
}
