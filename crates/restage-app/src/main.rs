//! restage - staged migration runner
//!
//! Applies a manifest of generated patches to a project one stage at a time,
//! gating each stage on a build and test cycle.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use restage_adapters::{CheckpointStore, PipelineConfig};
use restage_core::{ExecutionContext, MigrationError, PipelineStep, RunOptions, RunSummary};
use restage_engine::{load_manifest, BackupManager, CommandVerifier, Pipeline, VerifyCommands};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LOCK_WAIT_SECS: u64 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "restage",
    about = "Apply generated patches stage by stage with build/test gating",
    long_about = "Plans a patch manifest into dependency-ordered stages, applies each\n\
                  stage, verifies it with the project's build and tests, repairs common\n\
                  build breakage, and checkpoints progress so a run can be resumed.",
    version
)]
struct Args {
    /// Patch manifest (JSON)
    manifest: PathBuf,

    /// Project to migrate (defaults to current directory)
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Config file (defaults to <project>/.restage/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Continue from the last checkpoint
    #[arg(long)]
    resume: bool,

    /// With a checkpoint, only reprocess files that failed
    #[arg(long)]
    retry_failed: bool,

    /// Start at this step: plan, execute, verify or report
    #[arg(long, value_name = "STEP")]
    from_step: Option<PipelineStep>,

    /// Delete the checkpoint and start clean
    #[arg(long)]
    clear_checkpoint: bool,

    /// Plan and validate without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Commit each passing stage and roll back if final verification fails
    #[arg(long)]
    auto_apply: bool,

    /// Skip running tests after each stage
    #[arg(long)]
    skip_tests: bool,

    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "restage failed");
            eprintln!("  ! {:#}", err);
            err.downcast_ref::<MigrationError>()
                .map(MigrationError::exit_code)
                .unwrap_or(2)
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(args: Args) -> Result<i32> {
    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", args.project.display()))?;

    let config = match &args.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load(&project, args.dry_run),
    };
    let manifest = load_manifest(&args.manifest)?;

    let options = RunOptions {
        resume: args.resume,
        retry_failed: args.retry_failed,
        from_step: args.from_step,
        clear_checkpoint: args.clear_checkpoint,
        dry_run: args.dry_run,
        auto_apply: args.auto_apply,
        skip_tests: args.skip_tests,
    };
    let ctx = ExecutionContext::new(&project, options);
    let store = CheckpointStore::new(&project);

    let _lock = if args.dry_run {
        None
    } else {
        Some(store.lock_project(Duration::from_secs(LOCK_WAIT_SECS))?)
    };

    let commands = VerifyCommands::resolve(&project, &config.commands);
    let verifier = CommandVerifier::new(&project, commands, args.dry_run);
    let backup = BackupManager::new(&project, &ctx.short_id(), args.dry_run, config.timeouts.vcs());

    let summary = Pipeline::new(&ctx, &config, &store, &verifier, &backup).run(manifest)?;

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, &store);
    }
    Ok(if summary.outcome.is_success() { 0 } else { 1 })
}

fn print_summary(summary: &RunSummary, store: &CheckpointStore) {
    let stages = &summary.stages;
    println!("  Run {} ({})", summary.run_id, summary.mode);
    println!("  Outcome: {:?}", summary.outcome);
    println!(
        "  Stages: {} planned, {} continued, {} skipped, {} blocked, {} aborted, {} retried",
        stages.planned, stages.continued, stages.skipped, stages.blocked, stages.aborted, stages.retried
    );
    println!(
        "  Patches: {} applied, {} failed",
        summary.applied_patches, summary.failed_patches
    );
    if let Some(snapshot) = &summary.snapshot {
        println!("  Snapshot: {}", snapshot);
    }
    if summary.rolled_back {
        println!("  Working tree restored to the start snapshot");
    }
    for line in &summary.recommendations {
        println!("  - {}", line);
    }
    println!("  Report: {}", store.report_path().display());
}
