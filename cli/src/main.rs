use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cadence_core::{
    find_pipeline, load_pipeline_config, paths, BranchCoordinator, PipelineError,
    PipelineExecutor, RunStore,
};
use cadence_observability::{init_logging, ProcessKind};
use cadence_runtime::{ProgressUpdate, RuntimeRegistry};
use cadence_types::{PipelineState, RunStatus, StageStatus, TriggerInfo};

const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_RUNTIME_FAILURE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Agent pipeline orchestrator")]
struct Cli {
    /// Repository root; defaults to the current directory.
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a pipeline on its run branch.
    Run {
        pipeline: String,
        /// Validate and print the plan without executing.
        #[arg(long)]
        dry_run: bool,
        /// Echo agent output snippets while stages run.
        #[arg(long)]
        verbose: bool,
    },
    /// List recent runs.
    History {
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete run records and pipeline branches.
    Cleanup {
        #[arg(long)]
        pipeline: Option<String>,
        /// Remove everything, not just a single pipeline.
        #[arg(long)]
        all: bool,
        /// Force-delete branches with unmerged work.
        #[arg(long)]
        force: bool,
        /// Also delete matching branches on the default remote.
        #[arg(long)]
        delete_remote: bool,
        /// Branch namespace to sweep.
        #[arg(long, default_value = "cadence")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let repo = cli
        .repo
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let logging = match init_logging(ProcessKind::Cli, &paths::logs_dir(&repo), 14) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("warning: logging init failed: {e}");
            None
        }
    };

    let code = match cli.command {
        Command::Run {
            pipeline,
            dry_run,
            verbose,
        } => run_pipeline(&repo, &pipeline, dry_run, verbose).await,
        Command::History { pipeline, limit } => show_history(&repo, pipeline.as_deref(), limit),
        Command::Cleanup {
            pipeline,
            all,
            force,
            delete_remote,
            prefix,
        } => cleanup(&repo, pipeline.as_deref(), all, force, delete_remote, &prefix).await,
    };

    // flush the file appender before exiting
    drop(logging);
    std::process::exit(code);
}

async fn run_pipeline(repo: &PathBuf, name: &str, dry_run: bool, verbose: bool) -> i32 {
    let config = match find_pipeline(repo, name).and_then(|path| load_pipeline_config(&path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USER_ERROR;
        }
    };

    tracing::info!(pipeline = %config.name, dry_run, "starting pipeline");

    let registry = Arc::new(RuntimeRegistry::with_defaults());
    let mut executor = match PipelineExecutor::new(repo.clone(), registry) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_FAILURE;
        }
    };

    if dry_run {
        return match executor.dry_run(&config) {
            Ok(plan) => {
                print_plan(&plan);
                EXIT_OK
            }
            Err(e) => {
                eprintln!("error: {e}");
                EXIT_USER_ERROR
            }
        };
    }

    if verbose {
        executor = executor.with_progress(Arc::new(|stage: &str, update: ProgressUpdate| {
            match update {
                ProgressUpdate::Text { snippet } => {
                    let snippet = snippet.trim();
                    if !snippet.is_empty() {
                        println!("  [{stage}] {snippet}");
                    }
                }
                ProgressUpdate::ToolActivity { tool, .. } => {
                    println!("  [{stage}] using {tool}");
                }
            }
        }));
    }

    // Ctrl-C cancels the run cooperatively; the scheduler joins in-flight
    // stages before the final state write.
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested, winding down...");
            trip.cancel();
        }
    });

    let trigger = TriggerInfo::manual();
    match executor.run(config, trigger, cancel).await {
        Ok(state) => {
            print_summary(&state);
            match state.status {
                RunStatus::Completed => EXIT_OK,
                RunStatus::Cancelled => EXIT_CANCELLED,
                _ => EXIT_RUNTIME_FAILURE,
            }
        }
        Err(PipelineError::Validation(message)) => {
            eprintln!("invalid pipeline: {message}");
            EXIT_USER_ERROR
        }
        Err(PipelineError::Cancelled) => EXIT_CANCELLED,
        Err(e) => {
            eprintln!("run failed: {e}");
            EXIT_RUNTIME_FAILURE
        }
    }
}

fn print_plan(plan: &cadence_core::ExecutionGraph) {
    println!("execution plan ({} stages):", plan.len());
    for (level, group) in plan.level_groups.iter().enumerate() {
        println!("  level {level}: {}", group.join(", "));
    }
    println!("max parallelism: {}", plan.max_parallelism);
}

fn print_summary(state: &PipelineState) {
    let counts = state.counts();
    println!();
    println!(
        "{} [{}] — {} total: {} succeeded, {} failed, {} skipped, {} cancelled",
        state.pipeline_config.name,
        status_word(state.status),
        counts.total,
        counts.succeeded,
        counts.failed,
        counts.skipped,
        counts.cancelled,
    );
    for stage in &state.stages {
        println!("  {}", stage_row(stage));
        if let Some(error) = &stage.error {
            if stage.status == StageStatus::Failed {
                println!("      {}", error.message);
                if let Some(suggestion) = &error.suggestion {
                    println!("      hint: {suggestion}");
                }
            }
        }
    }
    if !state.artifacts.changed_files.is_empty() {
        println!("changed files: {}", state.artifacts.changed_files.len());
    }
    println!("total duration: {}ms", state.artifacts.total_duration_ms);
}

fn stage_row(stage: &cadence_types::StageExecution) -> String {
    let mut row = format!(
        "{:<24} {:<10} {:>7}ms",
        stage.stage_name,
        stage_status_word(stage.status),
        stage.duration_ms
    );
    if stage.attempt > 1 {
        row.push_str(&format!("  (attempt {})", stage.attempt));
    }
    if let Some(sha) = &stage.commit_sha {
        row.push_str(&format!("  {}", &sha[..sha.len().min(8)]));
    }
    row
}

fn status_word(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn stage_status_word(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Running => "running",
        StageStatus::Success => "success",
        StageStatus::Failed => "failed",
        StageStatus::Skipped => "skipped",
        StageStatus::Cancelled => "cancelled",
    }
}

fn show_history(repo: &PathBuf, pipeline: Option<&str>, limit: usize) -> i32 {
    let store = match RunStore::new(repo) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_FAILURE;
        }
    };
    let runs = match store.all() {
        Ok(runs) => runs,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_FAILURE;
        }
    };

    let mut shown = 0;
    for run in runs {
        if let Some(pipeline) = pipeline {
            if run.pipeline_config.name != pipeline {
                continue;
            }
        }
        if shown >= limit {
            break;
        }
        let counts = run.counts();
        println!(
            "{}  {:<20} {:<10} {}  {} stages ({} ok / {} failed)",
            run.trigger.timestamp.format("%Y-%m-%d %H:%M:%S"),
            run.pipeline_config.name,
            status_word(run.status),
            &run.run_id[..run.run_id.len().min(8)],
            counts.total,
            counts.succeeded,
            counts.failed,
        );
        shown += 1;
    }
    if shown == 0 {
        println!("no runs recorded");
    }
    EXIT_OK
}

async fn cleanup(
    repo: &PathBuf,
    pipeline: Option<&str>,
    all: bool,
    force: bool,
    delete_remote: bool,
    prefix: &str,
) -> i32 {
    if pipeline.is_none() && !all {
        eprintln!("specify --pipeline <name> or --all");
        return EXIT_USER_ERROR;
    }

    let store = match RunStore::new(repo) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_FAILURE;
        }
    };

    let mut deleted_runs = 0;
    match pipeline {
        Some(name) => match store.delete_by_pipeline(name) {
            Ok(count) => deleted_runs += count,
            Err(e) => eprintln!("warning: {e}"),
        },
        None => {
            // --all: sweep every recorded pipeline
            if let Ok(runs) = store.all() {
                let mut names: Vec<String> =
                    runs.iter().map(|r| r.pipeline_config.name.clone()).collect();
                names.sort();
                names.dedup();
                for name in names {
                    if let Ok(count) = store.delete_by_pipeline(&name) {
                        deleted_runs += count;
                    }
                }
            }
        }
    }

    let coordinator = BranchCoordinator::new(repo.clone());
    let mut deleted_branches = 0;
    match coordinator.list_pipeline_branches(prefix).await {
        Ok(branches) => {
            for branch in branches {
                if let Some(name) = pipeline {
                    if !branch.starts_with(&format!("{prefix}/{name}")) {
                        continue;
                    }
                }
                match coordinator.delete_branch(&branch, force).await {
                    Ok(()) => deleted_branches += 1,
                    Err(e) => eprintln!("warning: could not delete '{branch}': {e}"),
                }
                if delete_remote {
                    if let Err(e) = coordinator.delete_remote(&branch, "origin").await {
                        eprintln!("warning: could not delete remote '{branch}': {e}");
                    }
                }
            }
        }
        Err(e) => eprintln!("warning: {e}"),
    }

    println!("removed {deleted_runs} run records, {deleted_branches} branches");
    EXIT_OK
}
