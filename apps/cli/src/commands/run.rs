//! Run command implementation.
//!
//! Queues the plan's operations, runs them on a background task, and renders
//! the runner's event stream until the run completes or halts.

use crate::plan::InstallPlan;
use anyhow::Context;
use callsheet_orchestrator::{OperationRunner, RunEvent};
use callsheet_provisioning::ProvisioningSession;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Execute the run command.
///
/// Returns whether every operation completed.
pub async fn execute(plan_path: &Path, json: bool, token: Option<String>) -> anyhow::Result<bool> {
    let plan = InstallPlan::load(plan_path)?;
    let source = Arc::new(plan.token_source(token.as_deref()));
    let session = Arc::new(
        ProvisioningSession::new(source, plan.endpoints.clone())
            .context("Failed to create HTTP session")?,
    );

    let mut runner = OperationRunner::new();
    runner.set_indeterminate(plan.indeterminate);
    runner.enqueue_all(plan.build(&session)?);
    let events = runner.subscribe();

    if !json {
        println!("{} {}", "callsheet run".bold().cyan(), plan.name.bold());
        println!();
    }
    info!(plan = %plan.name, operations = plan.operations.len(), "Starting install plan");

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current operation");
            cancel.cancel();
        }
    });

    let handle = runner.begin_operations();
    render(events, json).await;
    let (_, outcome) = handle.wait().await?;

    if !json {
        println!();
        if outcome.is_completed() {
            println!("{} {} operation(s) completed", "✓".green(), outcome.executed);
        } else if let Some(halt) = &outcome.halt {
            println!(
                "{} Halted at {}: {}",
                "✗".red(),
                halt.operation_name.bold(),
                halt.reason.to_string().red()
            );
        }
    }
    Ok(outcome.is_completed())
}

/// Prints events until the run's terminal event.
async fn render(mut events: Receiver<RunEvent>, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event renderer fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let terminal = matches!(event, RunEvent::Completed { .. } | RunEvent::Halted { .. });
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to encode event"),
            }
        } else {
            print_human(&event);
        }
        if terminal {
            return;
        }
    }
}

fn print_human(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { total: Some(total), .. } => {
            println!("  {} {} operation(s) queued", "•".dimmed(), total);
        }
        RunEvent::RunStarted { total: None, .. } => {
            println!("  {} Running", "•".dimmed());
        }
        RunEvent::OperationStarted { name, .. } => println!("{} {}", "▶".cyan(), name.bold()),
        RunEvent::OperationSucceeded { name, .. } => println!("{} {}", "✓".green(), name),
        RunEvent::OperationFailed { name, reason, .. } => {
            println!("{} {}: {}", "✗".red(), name, reason.to_string().red());
        }
        RunEvent::Log { line } => println!("    {}", line.dimmed()),
        RunEvent::Compensated { name, ok: true, .. } => println!("{} Undid {}", "↺".yellow(), name),
        RunEvent::Compensated { name, ok: false, .. } => {
            println!("{} Could not undo {}", "!".yellow(), name);
        }
        RunEvent::Halted { .. } | RunEvent::Completed { .. } => {}
    }
}
