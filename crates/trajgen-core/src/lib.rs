//! Core of the research-trajectory generator.
//!
//! A [`TurnLoop`] alternates between a [`LanguageModel`] and the tools held in
//! a [`ToolRegistry`], parsing the model's markup into calls and answers until
//! the question is answered or a limit is hit. The [`BatchOrchestrator`] runs
//! many loops concurrently and keeps an append-only sample log plus a
//! resumable [`Checkpoint`].

mod audit;
mod batch;
mod budget;
mod checkpoint;
mod config;
mod dispatch;
mod engine;
mod error;
mod events;
mod logging;
mod markup;
mod metrics;
mod model;
mod prompt;
mod retry;
mod security;
mod sink;
mod telemetry;
mod tools;
mod trace;
mod trajectory;

pub use audit::{AuditReport, DatasetAudit, MissingAnswerTally, ToolTally};
pub use batch::{BatchConfig, BatchOrchestrator, BatchSummary, ItemFailure, classify};
pub use budget::{BudgetCheck, BudgetScope, CallBudget, CallCounter};
pub use checkpoint::{Checkpoint, CheckpointStore, ResumePlan};
pub use config::{
    BatchSettings, BrowseConfig, Config, ConfigLoader, EngineConfig, LiteratureConfig,
    ModelConfig, RetryConfig, SearchConfig, ToolsConfig,
};
pub use dispatch::{ToolDispatcher, ToolStats};
pub use engine::{LoopConfig, TrajectoryGenerator, TurnLoop};
pub use error::{ModelError, Retryable, ToolError, TrajgenError};
pub use events::{BatchEvent, EventCollector, ItemOutcome};
pub use logging::ToolCallLog;
pub use markup::{
    DEFAULT_STOPS, Directive, ParamValue, ParsedBlock, Repair, TagEvent, ToolInvocation,
    ToolParams, extract_citations, parse_block, render_tool_output, scan_tags,
};
pub use model::{CompletionRequest, GenerationParams, LanguageModel, Message, Role};
pub use prompt::{CONTINUE_PROMPT, build_system_prompt, forced_answer_directive};
pub use retry::{RetryPolicy, with_fallback};
pub use security::{SecretValue, optional_env, require_env};
pub use sink::{OutputLog, QuestionItem, SampleRecord, SampleStatus, load_questions};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use tools::{Activation, ResearchTool, ResolvedTool, ToolOptions, ToolOutput, ToolRegistry};
pub use trace::{TranscriptStep, TranscriptSummary};
pub use trajectory::{Termination, ToolCallRecord, Trajectory, assemble, truncate_payload};
