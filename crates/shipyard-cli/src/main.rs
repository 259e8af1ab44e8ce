//! CLI binary for driving pull requests through the Shipyard release pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use shipyard_pipeline::{
    validate, DriverConfig, FileRunStore, LoggingCollaborators, MemoryRunStore, NewRun,
    PipelineDriver, RecordingCollaborators, Severity, TransitionTable, TriggerOutcome,
};
use shipyard_types::{PipelineRunRecord, PipelineState, Trigger};

#[derive(Parser)]
#[command(name = "shipyard", version, about = "Release pipeline state machine for pull requests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding one JSON record per pipeline run
    #[arg(long, global = true, default_value = ".shipyard/runs")]
    store: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the transition table
    Table,

    /// Lint the transition table
    Validate,

    /// Open a pipeline run for a pull request
    Open {
        /// Pull request number
        #[arg(long)]
        pr: u64,

        /// Source branch of the pull request
        #[arg(long)]
        branch: String,

        /// Branch the pull request merges into
        #[arg(long, default_value = "main")]
        target: String,

        /// Head commit of the pull request
        #[arg(long)]
        sha: String,

        /// Fix attempts allowed before a critical gate failure fails the run. Default: 3.
        #[arg(long)]
        max_fix_cycles: Option<u32>,
    },

    /// Apply a trigger to a stored run
    Trigger {
        run_id: String,

        /// Trigger name, e.g. GatePassed or gate-passed
        trigger: Trigger,
    },

    /// Show a stored run and its history
    Show {
        run_id: String,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },

    /// List stored runs
    List {
        /// Only show active runs idle for at least this many minutes
        #[arg(long)]
        stale_minutes: Option<i64>,
    },

    /// Run a trigger sequence against an in-memory run
    Simulate {
        #[arg(long, default_value = "3")]
        max_fix_cycles: u32,

        /// Triggers applied after PrOpened, in order
        triggers: Vec<Trigger>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(store = %cli.store.display(), "Using run store");

    match cli.command {
        Commands::Table => cmd_table(),
        Commands::Validate => cmd_validate()?,
        Commands::Open {
            pr,
            branch,
            target,
            sha,
            max_fix_cycles,
        } => {
            let mut new_run = NewRun::new(pr, branch, target, sha);
            new_run.max_fix_cycles = max_fix_cycles;
            cmd_open(&cli.store, new_run).await?;
        }
        Commands::Trigger { run_id, trigger } => {
            cmd_trigger(&cli.store, &run_id, trigger).await?;
        }
        Commands::Show { run_id, json } => {
            cmd_show(&cli.store, &run_id, json).await?;
        }
        Commands::List { stale_minutes } => {
            cmd_list(&cli.store, stale_minutes).await?;
        }
        Commands::Simulate {
            max_fix_cycles,
            triggers,
        } => {
            cmd_simulate(max_fix_cycles, &triggers).await?;
        }
    }

    Ok(())
}

/// A driver over the on-disk store. Collaborators only log what they would do.
fn file_driver(store: &std::path::Path) -> anyhow::Result<PipelineDriver> {
    let driver = PipelineDriver::standard(
        Arc::new(FileRunStore::new(store)),
        Arc::new(LoggingCollaborators),
        DriverConfig::default(),
    )?;
    Ok(driver)
}

fn cmd_table() {
    let table = TransitionTable::standard();
    println!("Transitions: {}", table.len());
    for state in PipelineState::ALL {
        let outgoing: Vec<_> = table.outgoing(state).collect();
        if outgoing.is_empty() {
            continue;
        }
        println!("\n{state}:");
        for def in outgoing {
            let guard = def.guard.map(|g| format!(" [{g}]")).unwrap_or_default();
            let effect = def
                .side_effect
                .map(|e| format!(" / {e}"))
                .unwrap_or_default();
            println!("  {} -> {}{}{}", def.trigger, def.to, guard, effect);
        }
    }
}

fn cmd_validate() -> anyhow::Result<()> {
    let diagnostics = validate(&TransitionTable::standard());

    if diagnostics.is_empty() {
        println!("Transition table is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_open(store: &std::path::Path, new_run: NewRun) -> anyhow::Result<()> {
    let driver = file_driver(store)?;
    let outcome = driver.open_run(new_run).await?;
    println!("Run: {}", outcome.run_id);
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_trigger(store: &std::path::Path, run_id: &str, trigger: Trigger) -> anyhow::Result<()> {
    let driver = file_driver(store)?;
    let outcome = driver.handle_trigger(run_id, trigger).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_show(store: &std::path::Path, run_id: &str, json: bool) -> anyhow::Result<()> {
    let driver = file_driver(store)?;
    let record = driver.run(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let ctx = &record.context;
    println!("Run: {}", record.run_id());
    println!("PR: #{} ({} -> {})", ctx.pr_number, ctx.branch, ctx.target_branch);
    println!("Commit: {}", ctx.commit_sha);
    println!("State: {}", record.state);
    println!("Fix cycles: {}/{}", ctx.fix_cycle_count, ctx.max_fix_cycles);
    if let Some(gate) = ctx.gate_name {
        println!("Last fixed gate: {gate}");
    }
    println!("Updated: {}", record.updated_at.to_rfc3339());

    if !record.state.is_terminal() {
        let accepted = driver.table().triggers_from(record.state);
        let names: Vec<_> = accepted.iter().map(|t| t.to_string()).collect();
        println!("Accepts: {}", names.join(", "));
    }

    println!("\nHistory:");
    for t in &record.history {
        let effect = t.side_effect.map(|e| format!(" / {e}")).unwrap_or_default();
        let auto = if t.synthetic { " (auto)" } else { "" };
        println!(
            "  {} {} --{}{}--> {}{}",
            t.at.format("%Y-%m-%d %H:%M:%S"),
            t.from,
            t.trigger,
            auto,
            t.to,
            effect
        );
    }
    Ok(())
}

async fn cmd_list(store: &std::path::Path, stale_minutes: Option<i64>) -> anyhow::Result<()> {
    let driver = file_driver(store)?;
    let runs = match stale_minutes {
        Some(minutes) => {
            let idle_for = chrono::Duration::try_minutes(minutes)
                .ok_or_else(|| anyhow::anyhow!("--stale-minutes {minutes} is out of range"))?;
            driver.stale_runs(idle_for).await?
        }
        None => driver.list_runs().await?,
    };

    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    for record in &runs {
        print_run_line(record);
    }
    Ok(())
}

async fn cmd_simulate(max_fix_cycles: u32, triggers: &[Trigger]) -> anyhow::Result<()> {
    let recorder = Arc::new(RecordingCollaborators::new());
    let driver = PipelineDriver::standard(
        Arc::new(MemoryRunStore::new()),
        recorder.clone(),
        DriverConfig {
            max_fix_cycles,
            ..DriverConfig::default()
        },
    )?;

    let opened = driver
        .open_run(NewRun::new(0, "simulation", "main", "0000000"))
        .await?;
    print_outcome(&opened);

    for trigger in triggers {
        match driver.handle_trigger(&opened.run_id, *trigger).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) if e.is_rejection() => {
                println!("  rejected: {e}");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let record = driver.run(&opened.run_id).await?;
    println!(
        "\nFinal state: {} after {} transitions (fix cycles {}/{})",
        record.state,
        record.history.len(),
        record.context.fix_cycle_count,
        record.context.max_fix_cycles
    );
    println!("Collaborator calls:");
    for call in recorder.calls() {
        println!("  {call:?}");
    }
    Ok(())
}

fn print_outcome(outcome: &TriggerOutcome) {
    for t in &outcome.applied {
        let effect = t.side_effect.map(|e| format!(" / {e}")).unwrap_or_default();
        let auto = if t.synthetic { " (auto)" } else { "" };
        println!("  {} --{}{}--> {}{}", t.from, t.trigger, auto, t.to, effect);
    }
}

fn print_run_line(record: &PipelineRunRecord) {
    println!(
        "{}  PR #{:<6} {:<18} fix {}/{}  updated {}",
        record.run_id(),
        record.context.pr_number,
        record.state.to_string(),
        record.context.fix_cycle_count,
        record.context.max_fix_cycles,
        record.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}
