//! Check command implementation.
//!
//! Loads a plan and builds its operations, reading every referenced file, without
//! contacting any API.

use crate::plan::InstallPlan;
use anyhow::Context;
use callsheet_provisioning::ProvisioningSession;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

/// Execute the check command.
pub fn execute(plan_path: &Path) -> anyhow::Result<()> {
    let plan = InstallPlan::load(plan_path)?;
    let session = ProvisioningSession::new(Arc::new(plan.token_source(None)), plan.endpoints.clone())
        .context("Failed to create HTTP session")?;
    let operations = plan.build(&Arc::new(session))?;

    println!("{} {}", "Plan".bold().cyan(), plan.name.bold());
    println!("  {} Id: {}", "•".dimmed(), plan.short_id());
    println!();
    for (index, (entry, op)) in plan.operations.iter().zip(&operations).enumerate() {
        println!("  {:>2}. {} {}", index + 1, op.name(), format!("({})", entry.kind()).dimmed());
    }
    println!();
    println!("{} {} operation(s)", "✓".green(), operations.len());
    Ok(())
}
