//! Execution inspection and operator commands.

use std::time::Duration;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use hopflow_core::repository::execution::{ExecutionFilter, ExecutionRepository};
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::status::WorkflowStatus;

use crate::cli::{format_relative_time, parse_value};
use crate::state::AppState;

/// Colored status cell shared by the execution tables.
pub fn status_cell(status: WorkflowStatus) -> Cell {
    let (label, color) = match status {
        WorkflowStatus::Pending => ("○ pending", Color::DarkGrey),
        WorkflowStatus::InProgress => ("● in progress", Color::Blue),
        WorkflowStatus::RetryPending => ("↻ retry pending", Color::Yellow),
        WorkflowStatus::Paused => ("‖ paused", Color::Yellow),
        WorkflowStatus::Passed => ("✓ passed", Color::DarkGreen),
        WorkflowStatus::Completed => ("✓ completed", Color::Green),
        WorkflowStatus::Failed => ("✗ failed", Color::Red),
        WorkflowStatus::Cancelled => ("◌ cancelled", Color::DarkGrey),
    };
    Cell::new(label).fg(color)
}

fn styled_status(status: WorkflowStatus) -> String {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => style(text).green().to_string(),
        WorkflowStatus::Failed => style(text).red().to_string(),
        WorkflowStatus::RetryPending | WorkflowStatus::Paused => style(text).yellow().to_string(),
        _ => style(text).dim().to_string(),
    }
}

/// Status, step, and error lines printed after `start` and `resume`.
pub fn print_execution_summary(exec: &WorkflowExecution) {
    println!(
        "  {} {} at step {}/{}{}",
        style("Status:").dim(),
        styled_status(exec.status),
        exec.current_step,
        exec.total_steps,
        exec.current_step_label
            .as_deref()
            .map(|l| format!(" ({l})"))
            .unwrap_or_default()
    );
    if let Some(retry) = &exec.retry_info {
        if exec.status == WorkflowStatus::RetryPending {
            let next = retry
                .next_retry_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} attempt {}/{}, next at {}",
                style("Retry:").dim(),
                retry.attempt,
                retry.max_attempts,
                next
            );
        }
    }
    if let Some(err) = &exec.error_info {
        println!("  {} [{}] {}", style("Error:").dim(), err.code, style(&err.message).red());
    }
}

pub async fn list_executions(
    state: &AppState,
    status: Option<String>,
    topic: Option<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let status = status
        .map(|s| s.parse::<WorkflowStatus>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let filter = ExecutionFilter {
        status,
        topic,
        limit: Some(limit),
    };
    let executions = state.runtime.store().list(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!(
            "  {} No executions found. Start one with: {}",
            style("i").blue().bold(),
            style("hopflow start orders --payload '{\"sku\":\"A-1\"}'").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Execution").fg(Color::White),
        Cell::new("Topic").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for exec in &executions {
        table.add_row(vec![
            Cell::new(&exec.execution_id).fg(Color::Cyan),
            Cell::new(&exec.topic),
            status_cell(exec.status),
            Cell::new(format!("{}/{}", exec.current_step, exec.total_steps)),
            Cell::new(exec.execution_attempts.len()),
            Cell::new(format_relative_time(&exec.updated_at)).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} execution{}",
        style(executions.len()).bold(),
        if executions.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

pub async fn show_execution(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let Some(exec) = state.runtime.store().find_by_id(execution_id).await? else {
        anyhow::bail!("execution '{execution_id}' not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style(&exec.topic).cyan().bold(),
        style(&exec.execution_id).bold()
    );
    println!("  {} {}", style("Correlation:").dim(), exec.correlation_id);
    println!(
        "  {} {} ({})",
        style("Created:").dim(),
        exec.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_relative_time(&exec.created_at)
    );
    if let Some(ms) = exec.duration_ms {
        println!("  {} {ms}ms", style("Duration:").dim());
    }
    print_execution_summary(&exec);
    println!();

    if !exec.step_history.is_empty() {
        let mut steps = Table::new();
        steps.load_preset(presets::UTF8_FULL_CONDENSED);
        steps.set_content_arrangement(ContentArrangement::Dynamic);
        steps.set_header(vec![
            Cell::new("Step").fg(Color::White),
            Cell::new("Label").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Attempt").fg(Color::White),
            Cell::new("Duration").fg(Color::White),
            Cell::new("Error").fg(Color::White),
        ]);
        for step in &exec.step_history {
            steps.add_row(vec![
                Cell::new(step.step_id),
                Cell::new(step.step_label.as_deref().unwrap_or("")),
                status_cell(step.status),
                Cell::new(step.attempt.map(|a| a.to_string()).unwrap_or_default()),
                Cell::new(step.duration_ms.map(|d| format!("{d}ms")).unwrap_or_default())
                    .fg(Color::DarkGrey),
                Cell::new(step.error_message.as_deref().unwrap_or("")).fg(Color::Red),
            ]);
        }
        println!("{steps}");
        println!();
    }

    if !exec.execution_attempts.is_empty() {
        let mut attempts = Table::new();
        attempts.load_preset(presets::UTF8_FULL_CONDENSED);
        attempts.set_content_arrangement(ContentArrangement::Dynamic);
        attempts.set_header(vec![
            Cell::new("Attempt").fg(Color::White),
            Cell::new("Steps").fg(Color::White),
            Cell::new("Result").fg(Color::White),
            Cell::new("Resumed By").fg(Color::White),
            Cell::new("Payload Edits").fg(Color::White),
        ]);
        for attempt in &exec.execution_attempts {
            let steps = match attempt.end_step {
                Some(end) => format!("{}→{}", attempt.start_step, end),
                None => format!("{}→", attempt.start_step),
            };
            let result = match attempt.result {
                Some(status) => status_cell(status),
                None => Cell::new("open").fg(Color::Blue),
            };
            attempts.add_row(vec![
                Cell::new(attempt.attempt_number),
                Cell::new(steps),
                result,
                Cell::new(attempt.resumed_by.as_deref().unwrap_or("")),
                Cell::new(attempt.payload_changes.len()),
            ]);
        }
        println!("{attempts}");
        println!();
    }

    if let Some(payload) = &exec.payload {
        println!("  {}", style("Payload").bold());
        for line in serde_json::to_string_pretty(payload)?.lines() {
            println!("    {line}");
        }
        println!();
    }
    Ok(())
}

pub async fn resume_execution(
    state: &AppState,
    execution_id: &str,
    from_step: Option<u32>,
    resumed_by: &str,
    wait_secs: u64,
    json: bool,
) -> Result<()> {
    state.start()?;
    let resumed = state
        .runtime
        .commands()
        .resume(execution_id, from_step, resumed_by)
        .await?;
    let settled = state
        .wait_until_settled(execution_id, resumed.version, Duration::from_secs(wait_secs))
        .await?;
    let exec = settled.unwrap_or(resumed);

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Resumed {} (attempt {})",
        style("↻").yellow().bold(),
        style(execution_id).bold(),
        exec.execution_attempts.len()
    );
    print_execution_summary(&exec);
    println!();
    Ok(())
}

pub async fn cancel_execution(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let exec = state.runtime.commands().cancel(execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Cancelled {} at step {}/{}",
        style("◌").dim().bold(),
        style(execution_id).bold(),
        exec.current_step,
        exec.total_steps
    );
    println!();
    Ok(())
}

pub async fn set_field(
    state: &AppState,
    execution_id: &str,
    path: &str,
    raw_value: &str,
    changed_by: &str,
    reason: Option<String>,
    json: bool,
) -> Result<()> {
    let value = parse_value(raw_value);
    let exec = state
        .runtime
        .payloads()
        .update_payload_field(execution_id, path, value.clone(), changed_by, reason)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Set {} = {} on {}",
        style("✓").green().bold(),
        style(path).cyan(),
        value,
        style(execution_id).bold()
    );
    println!(
        "  {} Resume with: {}",
        style("i").blue().bold(),
        style(format!("hopflow executions resume {execution_id}")).yellow()
    );
    println!();
    Ok(())
}

pub async fn restore_payload(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let exec = state.runtime.payloads().restore_payload(execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Restored payload of {}",
        style("✓").green().bold(),
        style(execution_id).bold()
    );
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::ORDERS_TOPIC;
    use serde_json::json;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let state = AppState::init(Some(dir.path().join("missing.toml")), Some(url))
            .await
            .unwrap();
        (dir, state)
    }

    #[tokio::test]
    async fn test_correct_payload_then_resume_completes() {
        let (_dir, state) = test_state().await;
        state.start().unwrap();

        let msg = state
            .runtime
            .start_workflow(ORDERS_TOPIC, json!({"customer": "c-1"}))
            .await
            .unwrap();
        let failed = state
            .wait_until_settled(&msg.execution_id, None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);

        set_field(&state, &msg.execution_id, "sku", "\"A-1\"", "ops", None, true)
            .await
            .unwrap();
        resume_execution(&state, &msg.execution_id, None, "ops", 5, true)
            .await
            .unwrap();

        let exec = state
            .runtime
            .store()
            .find_by_id(&msg.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(exec.execution_attempts.len(), 2);
        assert_eq!(exec.execution_attempts[1].resumed_by.as_deref(), Some("ops"));
        state.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status() {
        let (_dir, state) = test_state().await;
        let err = list_executions(&state, Some("sleeping".into()), None, 10, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown workflow status"));
    }

    #[tokio::test]
    async fn test_show_missing_execution_errors() {
        let (_dir, state) = test_state().await;
        assert!(show_execution(&state, "nope", true).await.is_err());
    }
}
