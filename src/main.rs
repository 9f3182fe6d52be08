use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use extupdate_lib::config::PlanConfig;
use extupdate_lib::db::SqliteStorage;
use extupdate_lib::migrate::{Engine, EngineOptions};
use extupdate_lib::plan::PlanUpdater;
use extupdate_lib::updater::{run_update, RunMode, Severity, UpdateReport};
use extupdate_lib::{default_db_path, logging};

#[derive(Debug, Parser)]
#[command(name = "extupdate", about = "Migrate legacy extension tables", version)]
struct Cli {
    /// SQLite database to migrate.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Also write daily-rotated JSON logs into this directory.
    #[arg(long, global = true, value_name = "PATH")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check prerequisites and run the plan's migration steps.
    Run(RunArgs),
    /// Validate a plan file without touching the database.
    Check {
        #[arg(long, value_name = "PATH")]
        plan: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "PATH")]
    plan: PathBuf,
    /// Accept an unloaded source extension whose tables are still present.
    #[arg(long)]
    override_source_requirement: bool,
    /// Run a single pass and stop, even when work remains.
    #[arg(long)]
    single_pass: bool,
    /// Do not wrap each batch in a transaction.
    #[arg(long)]
    no_transactions: bool,
    /// Emit the update report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let guard = match logging::init(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };

    match handle_cli(cli) {
        Ok(code) => {
            drop(guard);
            process::exit(code)
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            drop(guard);
            process::exit(1);
        }
    }
}

fn handle_cli(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => handle_run(cli.db, args),
        Commands::Check { plan } => handle_check(&plan),
    }
}

fn handle_run(db: Option<PathBuf>, args: RunArgs) -> Result<i32> {
    let plan = PlanConfig::load(&args.plan)
        .with_context(|| format!("load plan {}", args.plan.display()))?;
    let prerequisites = plan.prerequisites(args.override_source_requirement)?;
    let registry = plan.registry()?;

    let db_path = match db {
        Some(path) => path,
        None => default_db_path().context("determine database path")?,
    };
    ensure_parent(&db_path)?;
    let mut storage = SqliteStorage::open(&db_path)
        .with_context(|| format!("open database {}", db_path.display()))?;

    let options = EngineOptions {
        transactional: !args.no_transactions,
    };
    let mut engine = Engine::new(&mut storage).with_options(options);
    let mut updater = PlanUpdater::new(&plan);
    let mode = if args.single_pass {
        RunMode::Single
    } else {
        RunMode::UntilComplete
    };

    let report = run_update(&mut updater, &mut engine, &prerequisites, &registry, mode);
    if args.json {
        let json = serde_json::to_string_pretty(&report).context("serialize update report")?;
        println!("{json}");
    } else {
        print_report(&report);
    }
    Ok(if report.failed() { 1 } else { 0 })
}

fn handle_check(path: &Path) -> Result<i32> {
    let plan = PlanConfig::load(path).with_context(|| format!("load plan {}", path.display()))?;
    println!("Plan for extension {}", plan.extension);
    if let Some(source) = &plan.source_extension {
        println!("Source extension : {source}");
    }
    println!("Steps            : {}", plan.steps.len());
    for (index, step) in plan.steps.iter().enumerate() {
        println!("  {index:>3}  {}", step.kind());
    }
    Ok(0)
}

fn print_report(report: &UpdateReport) {
    for message in &report.messages {
        let label = match message.severity {
            Severity::Success => "ok",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        println!("[{label}] {message}");
    }
    println!("Passes: {}", report.passes);
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database parent directory {}", parent.display()))?;
    }
    Ok(())
}
