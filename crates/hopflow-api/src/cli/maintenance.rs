//! One-shot scheduler sweeps and outbox maintenance.
//!
//! These commands start broker delivery only, so a sweep run from the CLI
//! never overlaps the periodic one.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use hopflow_core::repository::execution::ExecutionRepository;
use hopflow_core::repository::outbox::OutboxRepository;
use hopflow_types::execution::WorkflowExecution;

use crate::cli::execution::status_cell;
use crate::state::AppState;

/// Resubmit every due retry, then wait for the resubmitted executions.
pub async fn sweep_retries(state: &AppState, wait_secs: u64, json: bool) -> Result<()> {
    let due: Vec<(String, Option<u64>)> = state
        .runtime
        .store()
        .find_pending_retries(Utc::now())
        .await?
        .into_iter()
        .map(|exec| (exec.execution_id, exec.version))
        .collect();

    state.start_delivery()?;
    let report = state.runtime.scheduler().process_pending_retries().await?;
    let settled = wait_all(state, &due, wait_secs).await?;

    if json {
        let out = serde_json::json!({ "report": report, "executions": settled });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} due, {} resubmitted, {} failed",
        style("↻").yellow().bold(),
        report.due,
        style(report.resubmitted).green(),
        if report.failed > 0 {
            style(report.failed).red()
        } else {
            style(report.failed).dim()
        }
    );
    print_settled(&settled);
    Ok(())
}

/// Delete completed and failed executions past retention.
pub async fn sweep_cleanup(state: &AppState, json: bool) -> Result<()> {
    let report = state.runtime.scheduler().cleanup_old_executions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Deleted {} completed and {} failed execution{}",
        style("✓").green().bold(),
        report.completed_deleted,
        report.failed_deleted,
        if report.completed_deleted + report.failed_deleted == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

/// Send ready outbox messages once, then wait for their executions.
pub async fn relay_outbox(state: &AppState, wait_secs: u64, json: bool) -> Result<()> {
    let store = state.runtime.store();
    let batch_size = state.runtime.config().outbox.batch_size;
    let mut pending = Vec::new();
    for record in store.find_ready(Utc::now(), batch_size).await? {
        let version = store
            .find_by_id(&record.execution_id)
            .await?
            .and_then(|exec| exec.version);
        pending.push((record.execution_id, version));
    }

    state.start_delivery()?;
    let report = state.runtime.relay().process_outbox().await?;
    let settled = wait_all(state, &pending, wait_secs).await?;

    if json {
        let out = serde_json::json!({ "report": report, "executions": settled });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} sent, {} retrying, {} failed",
        style("→").cyan().bold(),
        style(report.sent).green(),
        report.retried,
        if report.failed > 0 {
            style(report.failed).red()
        } else {
            style(report.failed).dim()
        }
    );
    print_settled(&settled);
    Ok(())
}

pub async fn outbox_stats(state: &AppState, json: bool) -> Result<()> {
    let stats = state.runtime.relay().stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Pending").fg(Color::White),
        Cell::new("Sent").fg(Color::White),
        Cell::new("Failed").fg(Color::White),
    ]);
    table.add_row(vec![
        Cell::new(stats.pending).fg(Color::Yellow),
        Cell::new(stats.sent).fg(Color::Green),
        Cell::new(stats.failed).fg(if stats.failed > 0 { Color::Red } else { Color::DarkGrey }),
    ]);

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn outbox_cleanup(state: &AppState, json: bool) -> Result<()> {
    let deleted = state.runtime.relay().cleanup_sent().await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": deleted }));
        return Ok(());
    }

    println!();
    println!(
        "  {} Deleted {} relayed message{}",
        style("✓").green().bold(),
        deleted,
        if deleted == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

async fn wait_all(
    state: &AppState,
    executions: &[(String, Option<u64>)],
    wait_secs: u64,
) -> Result<Vec<WorkflowExecution>> {
    let timeout = Duration::from_secs(wait_secs);
    let mut settled = Vec::with_capacity(executions.len());
    for (execution_id, version) in executions {
        if let Some(exec) = state.wait_until_settled(execution_id, *version, timeout).await? {
            settled.push(exec);
        }
    }
    Ok(settled)
}

fn print_settled(executions: &[WorkflowExecution]) {
    if executions.is_empty() {
        println!();
        return;
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Execution").fg(Color::White),
        Cell::new("Topic").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Step").fg(Color::White),
    ]);
    for exec in executions {
        table.add_row(vec![
            Cell::new(&exec.execution_id).fg(Color::Cyan),
            Cell::new(&exec.topic),
            status_cell(exec.status),
            Cell::new(format!("{}/{}", exec.current_step, exec.total_steps)),
        ]);
    }
    println!();
    println!("{table}");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::ORDERS_TOPIC;
    use hopflow_types::status::WorkflowStatus;
    use serde_json::json;

    async fn test_state(config: &str) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("hopflow.toml");
        tokio::fs::write(&config_path, config).await.unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let state = AppState::init(Some(config_path), Some(url)).await.unwrap();
        (dir, state)
    }

    #[tokio::test]
    async fn test_manual_retry_sweep_completes_order() {
        let (_dir, state) = test_state(
            "[retry]\ninitial_delay_ms = 1\nmax_delay_ms = 1\n\n[scheduler]\nenabled = false\n",
        )
        .await;
        state.start_delivery().unwrap();

        let msg = state
            .runtime
            .start_workflow(ORDERS_TOPIC, json!({"sku": "A-1", "fail_reserve_times": 1}))
            .await
            .unwrap();
        let pending = state
            .wait_until_settled(&msg.execution_id, None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.status, WorkflowStatus::RetryPending);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = state.runtime.scheduler().process_pending_retries().await.unwrap();
        assert_eq!(report.resubmitted, 1);

        let exec = state
            .wait_until_settled(&msg.execution_id, pending.version, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert!(exec.payload.unwrap()["reservation_id"].is_string());
        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_outbox_stats_start_empty() {
        let (_dir, state) = test_state("").await;
        let stats = state.runtime.relay().stats().await.unwrap();
        assert_eq!((stats.pending, stats.sent, stats.failed), (0, 0, 0));
        outbox_cleanup(&state, true).await.unwrap();
    }
}
