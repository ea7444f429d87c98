//! Engine lifecycle commands: run, start, workflows, config.

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::cli::execution::print_execution_summary;
use crate::state::AppState;

/// Run the engine until Ctrl-C or `duration_secs` elapses.
pub async fn run(state: &AppState, duration_secs: Option<u64>, json: bool) -> Result<()> {
    state.start()?;

    if !json {
        println!();
        println!(
            "  {} hopflow engine running ({} workflow{})",
            style("▶").green().bold(),
            state.runtime.registry().len(),
            if state.runtime.registry().len() == 1 { "" } else { "s" }
        );
        println!("  {} {}", style("Database:").dim(), state.database_url);
        println!("  {}", style("Press Ctrl-C to stop").dim());
        println!();
    }

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                res = tokio::signal::ctrl_c() => res?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    tracing::info!("shutdown requested");
    state.runtime.shutdown().await;

    if json {
        println!("{}", serde_json::json!({ "stopped": true }));
    } else {
        println!("  {} Engine stopped", style("■").dim());
    }
    Ok(())
}

/// Start a workflow and wait for it to settle.
pub async fn start(
    state: &AppState,
    topic: &str,
    payload: &str,
    wait_secs: u64,
    json: bool,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("--payload must be valid JSON")?;

    state.start()?;
    let message = state.runtime.start_workflow(topic, payload).await?;
    let execution = state
        .wait_until_settled(&message.execution_id, None, Duration::from_secs(wait_secs))
        .await?;

    if json {
        let out = serde_json::json!({
            "execution_id": message.execution_id,
            "correlation_id": message.correlation_id,
            "execution": execution,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Started '{}' execution {}",
        style("✓").green().bold(),
        style(topic).cyan(),
        style(&message.execution_id).bold()
    );
    match execution {
        Some(exec) => print_execution_summary(&exec),
        None => println!(
            "  {} Not recorded yet; check with: {}",
            style("i").blue().bold(),
            style(format!("hopflow executions show {}", message.execution_id)).yellow()
        ),
    }
    println!();
    Ok(())
}

/// List registered workflows with their steps.
pub async fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let registry = state.runtime.registry();
    let mut topics = registry.topics();
    topics.sort();

    let definitions: Vec<_> = topics.iter().filter_map(|t| registry.get(t)).collect();

    if json {
        let out: Vec<_> = definitions
            .iter()
            .map(|def| {
                serde_json::json!({
                    "topic": def.topic,
                    "description": def.description,
                    "steps": def.step_summaries(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Topic").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Label").fg(Color::White),
        Cell::new("Timeout").fg(Color::White),
        Cell::new("Flags").fg(Color::White),
        Cell::new("Description").fg(Color::White),
    ]);

    for def in &definitions {
        for step in def.step_summaries() {
            let topic = if step.id == 1 { def.topic.as_str() } else { "" };
            let timeout = step
                .timeout_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                Cell::new(topic).fg(Color::Cyan),
                Cell::new(step.id),
                Cell::new(&step.label),
                Cell::new(timeout).fg(Color::DarkGrey),
                Cell::new(step_flags(step.skippable, step.continue_on_failure)).fg(Color::Yellow),
                Cell::new(step.description.as_deref().unwrap_or("")),
            ]);
        }
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn step_flags(skippable: bool, continue_on_failure: bool) -> String {
    let flags: Vec<&str> = [
        skippable.then_some("skippable"),
        continue_on_failure.then_some("continue"),
    ]
    .into_iter()
    .flatten()
    .collect();
    flags.join(", ")
}

/// Print the effective configuration.
pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    let config = state.runtime.config();
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!(
        "# {} {}",
        style("loaded from").dim(),
        state.config_path.display()
    );
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
