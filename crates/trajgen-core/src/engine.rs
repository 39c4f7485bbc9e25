//! Turn loop driving one question to a finished trajectory.
//!
//! Each turn asks the model for a continuation, reduces it to a single
//! directive with [`parse_block`], and acts on it: dispatch a tool, accept an
//! answer, or nudge the model to keep going. Every path ends in a
//! [`Termination`]; the loop never errors out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::budget::{BudgetCheck, CallBudget, CallCounter};
use crate::dispatch::ToolDispatcher;
use crate::error::ModelError;
use crate::markup::{Directive, parse_block, render_tool_output};
use crate::metrics;
use crate::model::{CompletionRequest, GenerationParams, LanguageModel, Message};
use crate::prompt::{CONTINUE_PROMPT, build_system_prompt, forced_answer_directive};
use crate::retry::RetryPolicy;
use crate::trajectory::{Termination, ToolCallRecord, Trajectory, assemble, truncate_payload};

/// Anything that turns a question into a trajectory.
#[async_trait]
pub trait TrajectoryGenerator: Send + Sync {
    async fn generate(&self, question: &str) -> Trajectory;
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_turns: u32,
    /// Consecutive turns without a call or answer tolerated before stalling.
    pub max_idle_turns: u32,
    /// Suppressed over-budget calls tolerated before giving up.
    pub max_budget_violations: u32,
    pub budget: CallBudget,
    pub generation: GenerationParams,
    pub model_timeout: Duration,
    pub model_retry: RetryPolicy,
    pub result_preview_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_idle_turns: 3,
            max_budget_violations: 2,
            budget: CallBudget::unlimited(),
            generation: GenerationParams::default(),
            model_timeout: Duration::from_secs(180),
            model_retry: RetryPolicy::default(),
            result_preview_chars: 3000,
        }
    }
}

struct TurnState {
    history: Vec<Message>,
    fragments: Vec<String>,
    tool_calls: Vec<ToolCallRecord>,
    counter: CallCounter,
    final_answer: Option<String>,
    turns: u32,
    idle_turns: u32,
    budget_violations: u32,
}

impl TurnState {
    fn new(system_prompt: &str, question: &str) -> Self {
        Self {
            history: vec![Message::system(system_prompt), Message::user(question)],
            fragments: Vec::new(),
            tool_calls: Vec::new(),
            counter: CallCounter::default(),
            final_answer: None,
            turns: 0,
            idle_turns: 0,
            budget_violations: 0,
        }
    }
}

pub struct TurnLoop {
    model: Arc<dyn LanguageModel>,
    dispatcher: ToolDispatcher,
    config: LoopConfig,
    system_prompt: String,
    stops: Vec<String>,
}

impl TurnLoop {
    pub fn new(model: Arc<dyn LanguageModel>, dispatcher: ToolDispatcher, config: LoopConfig) -> Self {
        let system_prompt = build_system_prompt(dispatcher.registry(), &config.budget);
        let stops = dispatcher.registry().stop_sequences();
        Self {
            model,
            dispatcher,
            config,
            system_prompt,
            stops,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    #[instrument(skip_all, fields(model = %self.model.name()))]
    pub async fn run(&self, question: &str) -> Trajectory {
        let question = question.trim();
        if question.is_empty() {
            warn!("Rejecting empty question");
            return assemble(
                question,
                &[],
                Vec::new(),
                None,
                Termination::Rejected {
                    error: "question is empty".into(),
                },
                0,
            );
        }

        let mut state = TurnState::new(&self.system_prompt, question);
        let termination = self.drive(&mut state).await;

        let trajectory = assemble(
            question,
            &state.fragments,
            state.tool_calls,
            state.final_answer,
            termination,
            state.turns,
        );
        metrics::record_trajectory(trajectory.termination.as_str(), trajectory.total_tool_calls);
        info!(
            termination = trajectory.termination.as_str(),
            turns = trajectory.turns,
            tool_calls = trajectory.total_tool_calls,
            cited = trajectory.cited_ids.len(),
            "Trajectory finished"
        );
        trajectory
    }

    async fn drive(&self, state: &mut TurnState) -> Termination {
        loop {
            if state.turns >= self.config.max_turns {
                return Termination::TurnLimit {
                    max_turns: self.config.max_turns,
                };
            }
            state.turns += 1;

            let raw = match self.complete(&state.history).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(turn = state.turns, error = %err, "Model unavailable, ending trajectory");
                    return Termination::ModelUnavailable {
                        error: err.to_string(),
                    };
                }
            };

            let block = parse_block(&raw);
            if !block.repairs.is_empty() {
                debug!(turn = state.turns, repairs = ?block.repairs, "Repaired model output");
                metrics::record_repairs(&block.repairs);
            }

            match block.directive {
                Directive::Answer { answer, fragment } => {
                    state.fragments.push(fragment.clone());
                    state.history.push(Message::assistant(fragment));
                    state.final_answer = Some(answer);
                    return Termination::Answered;
                }
                Directive::Call {
                    invocation,
                    prefix,
                    fragment,
                } => {
                    state.idle_turns = 0;
                    let budget_key = self
                        .dispatcher
                        .resolve_name(&invocation)
                        .unwrap_or_else(|| invocation.name.clone());

                    match self.config.budget.check(&budget_key, &state.counter) {
                        BudgetCheck::Exhausted(scope) => {
                            state.budget_violations += 1;
                            warn!(
                                tool = %budget_key,
                                violations = state.budget_violations,
                                "Suppressing over-budget tool call"
                            );
                            if !prefix.is_empty() {
                                state.fragments.push(prefix);
                            }
                            state.history.push(Message::assistant(fragment));
                            state.history.push(Message::user(forced_answer_directive(&scope)));
                            if state.budget_violations > self.config.max_budget_violations {
                                return Termination::BudgetExhausted { budget: scope };
                            }
                        }
                        BudgetCheck::Allowed => {
                            let (payload, body) = match self.dispatcher.dispatch(&invocation).await {
                                Ok(output) => (
                                    truncate_payload(output.raw, self.config.result_preview_chars),
                                    output.formatted,
                                ),
                                Err(err) => (
                                    json!({ "error": err.to_string(), "kind": err.kind() }),
                                    format!("Error: {err}"),
                                ),
                            };
                            state.counter.record(&budget_key);

                            let result_block = render_tool_output(&body);
                            state.fragments.push(fragment.clone());
                            state.fragments.push(result_block.clone());
                            state.history.push(Message::assistant(fragment));

                            let mut feedback = result_block;
                            if let Some(scope) = self.config.budget.reached(&budget_key, &state.counter)
                            {
                                feedback.push_str("\n\n");
                                feedback.push_str(&forced_answer_directive(&scope));
                            }
                            state.history.push(Message::user(feedback));
                            state
                                .tool_calls
                                .push(ToolCallRecord::resolved(invocation, budget_key, payload));
                        }
                    }
                }
                Directive::Continue { text } => {
                    state.idle_turns += 1;
                    if !text.is_empty() {
                        state.fragments.push(text.clone());
                        state.history.push(Message::assistant(text));
                    }
                    if state.idle_turns > self.config.max_idle_turns {
                        return Termination::Stalled {
                            idle_turns: state.idle_turns,
                        };
                    }
                    state.history.push(Message::user(CONTINUE_PROMPT));
                }
            }
        }
    }

    async fn complete(&self, history: &[Message]) -> Result<String, ModelError> {
        let timeout = self.config.model_timeout;
        self.config
            .model_retry
            .run("model_completion", |_| async move {
                let request = CompletionRequest {
                    messages: history,
                    stop: &self.stops,
                    params: &self.config.generation,
                };
                match tokio::time::timeout(timeout, self.model.complete(request)).await {
                    Ok(Ok(text)) if text.trim().is_empty() => {
                        Err(ModelError::transient("empty completion"))
                    }
                    Ok(result) => result,
                    Err(_) => Err(ModelError::transient(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await
    }
}

#[async_trait]
impl TrajectoryGenerator for TurnLoop {
    async fn generate(&self, question: &str) -> Trajectory {
        self.run(question).await
    }
}
