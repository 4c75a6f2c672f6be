use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use bulwark_config::{EnvOverrides, FileConfig, Reporter, build_runtime_options};
use bulwark_core::Bulwark;
use bulwark_retry::Cancellation;
use bulwark_runtime::FakeRuntime;
use bulwark_types::{OutcomeLabel, PlanItem};

#[derive(Parser, Debug)]
#[command(name = "bulwark", version)]
#[command(about = "Policy-driven updates for labeled compose services and containers")]
struct Cli {
    /// Root directory to scan for `bulwark.toml` (default: /).
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Restrict to a single target by name or id.
    #[arg(long)]
    target: Option<String>,

    /// Include targets that don't carry `bulwark.enabled=true`.
    #[arg(long)]
    include_disabled: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print what would be updated without touching anything.
    Plan,
    /// Apply updates allowed by policy.
    Apply {
        /// Run the pipeline without pulling, recreating, or probing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print recent run history alongside the current plan.
    Status {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print environment and connectivity diagnostics.
    Doctor,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = FileConfig::load_from_root(&cli.root)?;
    let env = EnvOverrides::from_process();
    let mut opts = build_runtime_options(file.as_ref(), &env);
    opts.root = cli.root.clone();

    // No in-tree production runtime driver ships with this crate (the
    // driver is an external collaborator the core only depends on through
    // `RuntimeDriver`); the CLI runs against the fake so every subcommand
    // below is honest about what it actually drives until a real driver
    // is wired in by the embedder.
    let runtime = FakeRuntime::new();
    let bulwark = Bulwark::new(runtime, opts)?;

    let cancel = Cancellation::new();
    let mut reporter = CliReporter;
    let target_filter = cli.target.as_deref();

    match cli.cmd {
        Commands::Plan => {
            let (run, plan) = bulwark.plan(target_filter, cli.include_disabled, &cancel, &mut reporter)?;
            print_plan(&plan);
            println!();
            println!("run: {} ({:?})", run.id, run.status);
        }
        Commands::Apply { dry_run } => {
            let (run, results) = bulwark.apply(target_filter, dry_run, &cancel, &mut reporter)?;
            for result in &results {
                print_result(result.outcome(), &result.service_id, &result.new_digest);
            }
            println!();
            println!(
                "run: {} ({:?}) applied={} skipped={} failed={} rollbacks={}",
                run.id,
                run.status,
                run.summary.applied,
                run.summary.skipped,
                run.summary.failed,
                run.summary.rollbacks
            );
        }
        Commands::Status { limit } => {
            let status = bulwark.status(&cancel, &mut reporter, limit)?;
            print_plan(&status.plan);
            println!();
            for run in &status.recent_runs {
                println!(
                    "{} {:?} mode={:?} applied={} skipped={} failed={}",
                    run.id, run.status, run.mode, run.summary.applied, run.summary.skipped, run.summary.failed
                );
            }
        }
        Commands::Doctor => {
            let report = bulwark.doctor(&cancel);
            println!("runtime_reachable: {}", report.runtime_reachable);
            if let Some(err) = &report.runtime_error {
                println!("runtime_error: {err}");
            }
            println!("store_backend: {}", report.store_backend);
            if let Some(path) = &report.state_path {
                println!("state_path: {path}");
            }
            println!("discord_webhook_locked: {}", report.discord_locked);
            println!("slack_webhook_locked: {}", report.slack_locked);
            println!("scheduled_jobs: {}", report.scheduled_jobs);
        }
    }

    Ok(())
}

fn print_plan(plan: &bulwark_types::Plan) {
    println!(
        "targets={} services={} updates_available={} allowed={}",
        plan.target_count, plan.service_count, plan.update_count, plan.allowed_count
    );
    println!();
    for item in &plan.items {
        print_plan_item(item);
    }
}

fn print_plan_item(item: &PlanItem) {
    let marker = if item.allowed { "->" } else { "  " };
    println!(
        "{marker} {} [{:?}] {} ({})",
        item.service_name, item.risk, item.reason, item.image
    );
    for warning in &item.warnings {
        println!("     warning: {warning}");
    }
}

fn print_result(outcome: OutcomeLabel, service_id: &str, new_digest: &str) {
    println!("{service_id}: {outcome:?} -> {new_digest}");
}
