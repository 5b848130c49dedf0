use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use runledger::config::{DatabaseEnvironment, ReporterConfig};
use runledger::harness::HarnessEvent;

#[derive(Parser)]
#[command(
    name = "runledger",
    about = "Records test-run outcomes in a database and sends run-end notifications",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database environment to record into
    #[arg(long, global = true, value_enum)]
    database_environment: Option<DatabaseEnvironment>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the executions and test case tables
    InitDb,

    /// Replay harness callbacks from a JSON-lines event log
    Replay {
        /// Event log, one JSON event per line
        events: PathBuf,

        /// Room or channel to notify (enables notifications)
        #[arg(long)]
        room_id: Option<String>,

        /// User to @mention on failures during business hours
        #[arg(long)]
        owner_to_mention: Option<String>,

        /// Also notify when the run succeeds
        #[arg(long)]
        notify_on_success: bool,

        /// Who started the run (defaults to the current user)
        #[arg(long)]
        initiator: Option<String>,
    },

    /// Show an execution and its test cases
    Show {
        execution_id: Uuid,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ReporterConfig::resolve(cli.config.as_deref())?;
    if let Some(env) = cli.database_environment {
        config.database.environment = env;
    }
    init_tracing(&config.logging.level, cli.json_logs || config.logging.json);

    match cli.command {
        Commands::InitDb => {
            let store = runledger::open_store(&config)?;
            store.initialize()?;
            println!(
                "Initialized {} database at {}",
                config.database.environment,
                store.credentials().database_path().display()
            );
        }
        Commands::Replay {
            events,
            room_id,
            owner_to_mention,
            notify_on_success,
            initiator,
        } => {
            if let Some(room) = room_id {
                config.notify.enabled = true;
                config.notify.recipient = Some(room);
            }
            if owner_to_mention.is_some() {
                config.notify.owner_to_mention = owner_to_mention;
            }
            if notify_on_success {
                config.notify.notify_on_success = true;
            }
            if initiator.is_some() {
                config.run.initiator = initiator;
            }
            replay(&config, &events)?;
        }
        Commands::Show { execution_id, json } => {
            let store = runledger::open_store(&config)?;
            let execution = store
                .fetch_execution(execution_id)?
                .with_context(|| format!("execution {} not found", execution_id))?;
            let cases = store.list_test_cases(execution_id)?;

            if json {
                let output = serde_json::json!({ "execution": execution, "test_cases": cases });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                let runtime = execution
                    .runtime_millis
                    .map(|ms| format!("{} ms", ms))
                    .unwrap_or_else(|| "running".to_string());
                println!("\nExecution {}", execution.execution_id);
                println!("Initiator: {}", execution.initiator);
                println!("Runtime:   {}", runtime);
                println!();
                println!("{:<50} | {:<10} | {:<10} | Runtime", "Test", "State", "Env");
                println!("{:-<50}-|-{:-<10}-|-{:-<10}-|-{:-<10}", "", "", "", "");
                for case in &cases {
                    let runtime = case
                        .runtime_millis
                        .map(|ms| format!("{} ms", ms))
                        .unwrap_or_default();
                    println!(
                        "{:<50} | {:<10} | {:<10} | {}",
                        case.address, case.state, case.environment_label, runtime
                    );
                    if let Some(message) = &case.message {
                        println!("{:<50} | {:<10} |   -> {}", "", "", message.trim_end());
                    }
                }
                println!();
            }
        }
    }

    Ok(())
}

fn replay(config: &ReporterConfig, events: &Path) -> Result<()> {
    let file = std::fs::File::open(events)
        .with_context(|| format!("failed to open event log: {}", events.display()))?;
    let mut reporter = runledger::reporter_from_config(config)?;

    let mut report = None;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", events.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: HarnessEvent = serde_json::from_str(&line)
            .with_context(|| format!("invalid event on line {}", idx + 1))?;
        if let Some(done) = reporter
            .handle(event)
            .with_context(|| format!("failed to handle event on line {}", idx + 1))?
        {
            report = Some(done);
        }
    }

    let report = report.context("event log ended without a run_end event")?;
    let summary = reporter.summary();
    println!(
        "Execution {}: {} ({} passed, {} failed, {} errors) in {} ms",
        report.finalize.execution_id,
        if report.successful { "PASSED" } else { "FAILED" },
        summary.successes.len(),
        summary.failures.len(),
        summary.errors.len(),
        report.finalize.runtime_millis
    );
    if !report.finalize.unreported.is_empty() {
        println!(
            "Warning: {} test case(s) never reported an outcome",
            report.finalize.unreported.len()
        );
    }
    if let Some(request) = &report.notification {
        let status = if report.delivered { "sent" } else { "not delivered" };
        println!("Notification to {} {}", request.recipient, status);
    }
    Ok(())
}
