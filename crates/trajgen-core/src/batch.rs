//! Batch orchestrator running many turn loops with resumable progress.
//!
//! Items run concurrently on a fixed-width semaphore. The orchestrator loop is
//! the only writer of the output log and checkpoint: it appends each finished
//! item immediately and saves progress every `checkpoint_every` items and at
//! exit.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, ResumePlan};
use crate::engine::TrajectoryGenerator;
use crate::events::{EventCollector, ItemOutcome};
use crate::retry::RetryPolicy;
use crate::sink::{OutputLog, QuestionItem, SampleRecord, SampleStatus};
use crate::trajectory::{Termination, Trajectory};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub concurrency: usize,
    /// Whole-trajectory retry applied when the model stayed unavailable.
    pub item_retry: RetryPolicy,
    pub checkpoint_every: usize,
    /// Recorded on every sample.
    pub model_label: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            item_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            checkpoint_every: 20,
            model_label: String::new(),
        }
    }
}

/// Error representing an item that did not produce a usable trajectory.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub reason: String,
    pub retryable: bool,
    /// Partial trajectory from the last attempt, persisted alongside the failure.
    pub trajectory: Option<Box<Trajectory>>,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let retry = if self.retryable {
            "retryable"
        } else {
            "terminal"
        };
        write!(f, "{retry} item failure: {}", self.reason)
    }
}

impl std::error::Error for ItemFailure {}

/// Classify a finished trajectory. Only an unreachable model or a rejected
/// question fail the item; every other termination is a usable sample.
pub fn classify(trajectory: Trajectory) -> Result<Trajectory, ItemFailure> {
    match &trajectory.termination {
        Termination::ModelUnavailable { error } => Err(ItemFailure {
            reason: error.clone(),
            retryable: true,
            trajectory: Some(Box::new(trajectory)),
        }),
        Termination::Rejected { error } => Err(ItemFailure {
            reason: error.clone(),
            retryable: false,
            trajectory: Some(Box::new(trajectory)),
        }),
        _ => Ok(trajectory),
    }
}

struct ItemReport {
    index: usize,
    item: QuestionItem,
    outcome: Result<Trajectory, ItemFailure>,
    attempts: u32,
    duration_ms: u64,
}

/// Summary report of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub total_items: usize,
    pub scheduled: usize,
    pub skipped: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed indices of this run, sorted.
    pub failed_indices: Vec<usize>,
    pub avg_tool_calls: f64,
    pub topics: BTreeMap<String, usize>,
    pub question_types: BTreeMap<String, usize>,
    pub terminations: BTreeMap<String, usize>,
    pub interrupted: bool,
    pub checkpoint_archived: Option<PathBuf>,
    pub duration_ms: u64,
}

impl BatchSummary {
    fn absorb(&mut self, report: &ItemReport, tool_calls_sum: &mut usize) {
        self.processed += 1;
        match &report.outcome {
            Ok(trajectory) => {
                self.succeeded += 1;
                *tool_calls_sum += trajectory.total_tool_calls;
                *self
                    .terminations
                    .entry(trajectory.termination.as_str().to_string())
                    .or_insert(0) += 1;
                let topic = report.item.topic.clone().unwrap_or_else(|| "unknown".into());
                *self.topics.entry(topic).or_insert(0) += 1;
                let kind = report
                    .item
                    .question_type
                    .clone()
                    .unwrap_or_else(|| "unknown".into());
                *self.question_types.entry(kind).or_insert(0) += 1;
            }
            Err(_) => {
                self.failed += 1;
                self.failed_indices.push(report.index);
            }
        }
        if self.succeeded > 0 {
            self.avg_tool_calls = *tool_calls_sum as f64 / self.succeeded as f64;
        }
    }
}

pub struct BatchOrchestrator {
    generator: Arc<dyn TrajectoryGenerator>,
    config: BatchConfig,
    output: OutputLog,
    checkpoints: CheckpointStore,
    events: EventCollector,
}

impl BatchOrchestrator {
    pub fn new(
        generator: Arc<dyn TrajectoryGenerator>,
        config: BatchConfig,
        output: OutputLog,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            generator,
            config,
            output,
            checkpoints,
            events: EventCollector::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = events;
        self
    }

    /// Run (or resume) the batch until every planned item finished or
    /// `shutdown` resolves.
    pub async fn run<S>(&self, items: Vec<QuestionItem>, shutdown: S) -> Result<BatchSummary>
    where
        S: Future<Output = ()>,
    {
        let started = Instant::now();
        let records = self.output.load_latest()?;
        let previous = self.checkpoints.load()?;
        let plan = ResumePlan::build(items.len(), previous.as_ref(), &records);

        let mut checkpoint = match previous {
            Some(mut checkpoint) => {
                if checkpoint.total_items != items.len() {
                    warn!(
                        checkpoint_items = checkpoint.total_items,
                        input_items = items.len(),
                        "Checkpoint was written for a different input size"
                    );
                    checkpoint.total_items = items.len();
                }
                checkpoint
            }
            None => Checkpoint::new(items.len(), self.output.path()),
        };
        checkpoint.reconcile(&records);

        let order = plan.order();
        let mut summary = BatchSummary {
            run_id: checkpoint.run_id.to_string(),
            total_items: items.len(),
            scheduled: order.len(),
            skipped: plan.skipped,
            ..BatchSummary::default()
        };
        info!(
            run_id = %checkpoint.run_id,
            total = items.len(),
            retry = plan.retry.len(),
            pending = plan.pending.len(),
            skipped = plan.skipped,
            concurrency = self.config.concurrency,
            "Starting batch"
        );
        if summary.scheduled == 0 {
            info!("Every item already completed, nothing to do");
            return Ok(summary);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for index in order {
            let Some(item) = items.get(index).cloned() else {
                continue;
            };
            join_set.spawn(run_item(
                self.generator.clone(),
                item,
                index,
                self.config.item_retry.clone(),
                semaphore.clone(),
                self.events.clone(),
            ));
        }

        let mut tool_calls_sum = 0usize;
        let mut since_save = 0usize;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown, if !summary.interrupted => {
                    warn!(in_flight = join_set.len(), "Shutdown requested, cancelling remaining items");
                    summary.interrupted = true;
                    join_set.abort_all();
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(report)) => {
                            self.persist(&report, &mut checkpoint)?;
                            summary.absorb(&report, &mut tool_calls_sum);
                            since_save += 1;
                            if since_save >= self.config.checkpoint_every.max(1) {
                                self.save_checkpoint(&checkpoint)?;
                                since_save = 0;
                            }
                        }
                        Some(Err(err)) if err.is_cancelled() => {}
                        Some(Err(err)) => {
                            error!(error = %err, "Batch item task panicked; it stays pending");
                        }
                    }
                }
            }
        }

        self.save_checkpoint(&checkpoint)?;
        if !summary.interrupted && checkpoint.is_complete() {
            summary.checkpoint_archived = self.checkpoints.archive()?;
        }

        summary.failed_indices.sort_unstable();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            interrupted = summary.interrupted,
            duration_ms = summary.duration_ms,
            "Batch finished"
        );
        Ok(summary)
    }

    fn persist(&self, report: &ItemReport, checkpoint: &mut Checkpoint) -> Result<()> {
        let (status, trajectory, error) = match &report.outcome {
            Ok(trajectory) => (SampleStatus::Ok, Some(trajectory.clone()), None),
            Err(failure) => (
                SampleStatus::Failed,
                failure.trajectory.as_deref().cloned(),
                Some(failure.reason.clone()),
            ),
        };
        let record = SampleRecord {
            sample_id: SampleRecord::sample_id_for(report.index),
            index: report.index,
            status,
            question: report.item.question.clone(),
            topic: report.item.topic.clone(),
            question_type: report.item.question_type.clone(),
            source_id: report.item.source_id(),
            trajectory,
            error,
            attempts: report.attempts,
            model: self.config.model_label.clone(),
            generated_at: Utc::now(),
        };
        self.output.append(&record)?;
        tracing::debug!(
            index = report.index,
            sample_id = %record.sample_id,
            duration_ms = report.duration_ms,
            "Persisted sample"
        );

        match &report.outcome {
            Ok(_) => checkpoint.record_success(report.index),
            Err(_) => checkpoint.record_failure(report.index),
        }
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.save(checkpoint)?;
        self.events
            .emit_checkpoint(checkpoint.processed_count, self.checkpoints.path().to_path_buf());
        Ok(())
    }
}

#[instrument(skip_all, fields(index = index))]
async fn run_item(
    generator: Arc<dyn TrajectoryGenerator>,
    item: QuestionItem,
    index: usize,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    events: EventCollector,
) -> ItemReport {
    let started = Instant::now();
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return ItemReport {
                index,
                item,
                outcome: Err(ItemFailure {
                    reason: "batch semaphore closed".into(),
                    retryable: false,
                    trajectory: None,
                }),
                attempts: 0,
                duration_ms: 0,
            };
        }
    };
    events.emit_started(index);

    let label = format!("item {index}");
    let (outcome, attempts) = policy
        .run_classified(
            &label,
            |failure: &ItemFailure| failure.retryable,
            |_| {
                let generator = generator.clone();
                let question = item.question.clone();
                async move { classify(generator.generate(&question).await) }
            },
        )
        .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let event_outcome = match &outcome {
        Ok(trajectory) => ItemOutcome::Success {
            termination: trajectory.termination.as_str().to_string(),
        },
        Err(failure) => ItemOutcome::Failure {
            reason: failure.reason.clone(),
            retryable: failure.retryable,
        },
    };
    events.emit_finished(index, event_outcome, attempts, duration_ms);

    ItemReport {
        index,
        item,
        outcome,
        attempts,
        duration_ms,
    }
}
