//! Callsheet CLI - runs install plans through the operation runner.
//!
//! This binary provides the `callsheet` command: it loads an install plan, queues
//! its operations, and renders progress and log events in the terminal.

mod commands;
mod config;
mod plan;

use clap::{Parser, Subcommand};
use config::CliConfig;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Callsheet - sequential provisioning for installers
#[derive(Parser, Debug)]
#[command(
    name = "callsheet",
    author,
    version,
    about = "Callsheet - sequential provisioning engine",
    long_about = "Callsheet runs the operations of an install plan one after another,\nwaits for long-running cloud operations, and stops at the first failure."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an install plan
    ///
    /// Executes every operation in order and stops at the first failure.
    /// Exits with status 1 if the run halted.
    Run {
        /// Path to the plan file
        plan: PathBuf,

        /// Stream run events as JSON lines
        #[arg(long)]
        json: bool,

        /// Bearer token for audiences the plan has no token for
        #[arg(long)]
        token: Option<String>,
    },

    /// Parse a plan and list its operations without running them
    Check {
        /// Path to the plan file
        plan: PathBuf,
    },

    /// Print a short id
    Id {
        /// Number of characters
        #[arg(long, default_value_t = callsheet_orchestrator::DEFAULT_ID_LENGTH)]
        length: usize,

        /// Return the id memoised under this name
        #[arg(long)]
        shared: Option<String>,
    },
}

fn parse_level(level: &str) -> Level {
    match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli_config = CliConfig::discover_and_load();

    // Flag beats environment beats config files.
    let level = args.log_level.as_deref().or(cli_config.log_level.as_deref()).unwrap_or("warn");
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Run { plan, json, token } => {
            let json = json || cli_config.output.wants_json();
            let token = token.or(cli_config.token);
            let completed = commands::run::execute(&plan, json, token).await?;
            if !completed {
                std::process::exit(1);
            }
        }
        Command::Check { plan } => {
            commands::check::execute(&plan)?;
        }
        Command::Id { length, shared } => {
            commands::id::execute(length, shared.as_deref());
        }
    }

    Ok(())
}
