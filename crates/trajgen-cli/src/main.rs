use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use trajgen_core::{
    BatchConfig, BatchEvent, BatchOrchestrator, BatchSummary, CheckpointStore, ConfigLoader,
    DatasetAudit, EventCollector, ItemOutcome, OutputLog, TelemetryOptions, ToolCallLog,
    ToolDispatcher, TranscriptSummary, TurnLoop, init_telemetry, load_questions,
};
use trajgen_tools::{ChatCompletionsModel, build_registry};

const SAMPLES_FILE: &str = "samples.jsonl";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const CALL_LOG_FILE: &str = "tool_calls.jsonl";
const STATS_FILE: &str = "stats.json";

#[derive(Parser, Debug)]
#[command(
    name = "trajgen",
    version,
    about = "Generate tool-using research trajectories"
)]
struct Cli {
    /// Log debug output from trajgen crates.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate trajectories for a question file, resuming earlier progress.
    Generate(GenerateArgs),
    /// Summarize tool-call health and missing answers in a sample log.
    Audit(AuditArgs),
    /// Print the step outline of one generated sample.
    Show(ShowArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// JSONL file with one `{"question": ...}` object per line.
    #[arg(long)]
    questions: PathBuf,

    /// Directory receiving samples, checkpoint, call log and stats.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Configuration file (defaults to `TRAJGEN_CONFIG` or `trajgen.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured number of concurrent trajectories.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only use the first N questions.
    #[arg(long)]
    limit: Option<usize>,

    /// Archive existing samples and checkpoint instead of resuming.
    #[arg(long, default_value_t = false)]
    fresh: bool,
}

#[derive(Args, Debug)]
struct AuditArgs {
    /// Sample log written by `generate`.
    file: PathBuf,

    /// Number of tools listed in the report.
    #[arg(long, default_value_t = 10)]
    top: usize,

    /// Print the report as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Sample log written by `generate`.
    file: PathBuf,

    /// Zero-based question index.
    #[arg(long)]
    index: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(TelemetryOptions::default().verbose(cli.verbose))?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Generate(args) => generate_command(args).await?,
            Command::Audit(args) => audit_command(args)?,
            Command::Show(args) => show_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn generate_command(args: GenerateArgs) -> Result<()> {
    let mut config = ConfigLoader::load(args.config.clone())?;
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        config.batch.concurrency = concurrency;
    }

    let mut items = load_questions(&args.questions)?;
    if let Some(limit) = args.limit {
        items.truncate(limit);
    }
    if items.is_empty() {
        bail!("no questions found in {}", args.questions.display());
    }

    fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("failed to create output directory {}", args.output_dir.display())
    })?;
    let output = OutputLog::new(args.output_dir.join(SAMPLES_FILE));
    let checkpoints = CheckpointStore::new(args.output_dir.join(CHECKPOINT_FILE));
    if args.fresh {
        for archived in [output.archive()?, checkpoints.archive()?].into_iter().flatten() {
            info!(path = %archived.display(), "Archived previous run");
        }
    }

    let model = ChatCompletionsModel::from_config(&config.model, config.model_api_key())
        .context("failed to build model client")?;
    let registry = build_registry(&config.tools)?;
    if registry.is_empty() {
        warn!("No tools registered; trajectories will contain answers only");
    }

    let mut dispatcher =
        ToolDispatcher::new(Arc::new(registry)).with_retry(config.retry.tool_policy());
    if config.engine.call_log_limit > 0 {
        dispatcher = dispatcher.with_call_log(Arc::new(ToolCallLog::new(
            args.output_dir.join(CALL_LOG_FILE),
            config.engine.call_log_limit,
        )));
    }

    let turn_loop = TurnLoop::new(Arc::new(model), dispatcher.clone(), config.loop_config());
    let batch_config = BatchConfig {
        concurrency: config.batch.concurrency,
        item_retry: config.retry.item_policy(),
        checkpoint_every: config.batch.checkpoint_every,
        model_label: turn_loop.model_name().to_string(),
    };

    info!(
        questions = items.len(),
        model = %batch_config.model_label,
        output = %output.path().display(),
        "Starting trajectory generation"
    );

    let (events, receiver) = EventCollector::new();
    let reporter = tokio::spawn(report_progress(receiver, items.len()));

    let orchestrator = BatchOrchestrator::new(Arc::new(turn_loop), batch_config, output, checkpoints)
        .with_events(events);
    let summary = orchestrator.run(items, shutdown_signal()).await?;
    drop(orchestrator);
    if let Err(err) = reporter.await {
        warn!(error = %err, "Progress reporter stopped unexpectedly");
    }

    let tool_stats: BTreeMap<_, _> = dispatcher.stats().into_iter().collect();
    let stats_path = args.output_dir.join(STATS_FILE);
    let stats = serde_json::json!({
        "summary": &summary,
        "tool_stats": tool_stats,
    });
    fs::write(&stats_path, serde_json::to_vec_pretty(&stats)?)
        .with_context(|| format!("failed to write stats {}", stats_path.display()))?;

    print_summary(&summary, &stats_path);
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Interrupt received, saving progress"),
        Err(err) => {
            warn!(error = %err, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

async fn report_progress(mut receiver: UnboundedReceiver<BatchEvent>, total: usize) {
    let mut finished = 0usize;
    while let Some(event) = receiver.recv().await {
        match event {
            BatchEvent::ItemFinished {
                index,
                outcome,
                attempts,
                duration_ms,
                ..
            } => {
                finished += 1;
                match outcome {
                    ItemOutcome::Success { termination } => info!(
                        index,
                        termination = %termination,
                        attempts,
                        duration_ms,
                        "[{finished}/{total}] sample finished"
                    ),
                    ItemOutcome::Failure { reason, retryable } => warn!(
                        index,
                        reason = %reason,
                        retryable,
                        attempts,
                        "[{finished}/{total}] sample failed"
                    ),
                }
            }
            BatchEvent::CheckpointSaved { processed, .. } => {
                tracing::debug!(processed, "Checkpoint saved");
            }
            BatchEvent::ItemStarted { .. } => {}
        }
    }
}

fn print_summary(summary: &BatchSummary, stats_path: &Path) {
    println!("Run {}", summary.run_id);
    println!(
        "  processed {} of {} scheduled ({} skipped as already done)",
        summary.processed, summary.scheduled, summary.skipped
    );
    println!(
        "  succeeded {} • failed {} • avg tool calls {:.2}",
        summary.succeeded, summary.failed, summary.avg_tool_calls
    );
    for (termination, count) in &summary.terminations {
        println!("  {termination}: {count}");
    }
    if !summary.failed_indices.is_empty() {
        println!("  failed indices: {:?}", summary.failed_indices);
    }
    if summary.interrupted {
        println!("  interrupted: rerun the same command to resume");
    }
    if let Some(archived) = &summary.checkpoint_archived {
        println!("  checkpoint archived to {}", archived.display());
    }
    println!("  stats written to {}", stats_path.display());
}

fn audit_command(args: AuditArgs) -> Result<()> {
    let report = DatasetAudit::analyze_log(&args.file)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_markdown(args.top));
    }
    Ok(())
}

fn show_command(args: ShowArgs) -> Result<()> {
    let records = OutputLog::new(&args.file).load_latest()?;
    let Some(record) = records.get(&args.index) else {
        bail!("no sample with index {} in {}", args.index, args.file.display());
    };

    println!("{} ({:?}, {} attempt(s))", record.sample_id, record.status, record.attempts);
    if let Some(error) = &record.error {
        println!("error: {error}");
    }
    match &record.trajectory {
        Some(trajectory) => println!(
            "{}",
            TranscriptSummary::from_trajectory(trajectory).render_markdown()
        ),
        None => println!("No trajectory recorded."),
    }
    Ok(())
}
