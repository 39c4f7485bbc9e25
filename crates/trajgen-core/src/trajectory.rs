//! Trajectory records and their pure assembly from turn fragments.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::budget::BudgetScope;
use crate::logging::preview;
use crate::markup::{TagEvent, ToolInvocation, ToolParams, extract_citations, scan_tags};

/// Why a turn loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Answered,
    TurnLimit { max_turns: u32 },
    Stalled { idle_turns: u32 },
    BudgetExhausted { budget: BudgetScope },
    ModelUnavailable { error: String },
    Rejected { error: String },
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::TurnLimit { .. } => "turn_limit",
            Self::Stalled { .. } => "stalled",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Canonical registry name; budgets and statistics use the same key.
    pub tool_name: String,
    /// Alias the model wrote in its call tag, when it differs from `tool_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_name: Option<String>,
    #[serde(default)]
    pub parameters: ToolParams,
    pub query: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn new(invocation: ToolInvocation, result: Value) -> Self {
        Self {
            tool_name: invocation.name,
            requested_name: None,
            parameters: invocation.params,
            query: invocation.query,
            result,
            timestamp: Utc::now(),
        }
    }

    /// Record a call under the name the registry resolved it to.
    pub fn resolved(invocation: ToolInvocation, tool_name: impl Into<String>, result: Value) -> Self {
        let tool_name = tool_name.into();
        let requested_name = (invocation.name != tool_name).then(|| invocation.name.clone());
        Self {
            tool_name,
            requested_name,
            ..Self::new(invocation, result)
        }
    }

    /// Name as it appears in the transcript's call tag.
    pub fn tag_name(&self) -> &str {
        self.requested_name.as_deref().unwrap_or(&self.tool_name)
    }

    /// A call failed when its payload is missing or carries an error marker.
    pub fn succeeded(&self) -> bool {
        if self.result.is_null() {
            return false;
        }
        !["error", "exception", "traceback"].iter().any(|key| {
            self.result
                .get(key)
                .is_some_and(|value| !value.is_null() && value != &Value::Bool(false) && value != "")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub question: String,
    pub transcript: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub final_answer: String,
    pub total_tool_calls: usize,
    pub tools_used: BTreeSet<String>,
    pub cited_ids: BTreeSet<String>,
    pub termination: Termination,
    #[serde(default)]
    pub turns: u32,
}

impl Trajectory {
    pub fn answered(&self) -> bool {
        matches!(self.termination, Termination::Answered)
    }

    /// Tag sequence the transcript must contain: one call and one result per
    /// record, then one answer when the loop finished with an answer.
    pub fn expected_tags(&self) -> Vec<TagEvent> {
        let mut events: Vec<TagEvent> = self
            .tool_calls
            .iter()
            .flat_map(|record| {
                [
                    TagEvent::Call {
                        name: record.tag_name().to_string(),
                    },
                    TagEvent::Result,
                ]
            })
            .collect();
        if self.answered() {
            events.push(TagEvent::Answer);
        }
        events
    }

    pub fn is_well_formed(&self) -> bool {
        self.total_tool_calls == self.tool_calls.len()
            && self
                .tools_used
                .iter()
                .all(|name| self.tool_calls.iter().any(|call| &call.tool_name == name))
            && scan_tags(&self.transcript) == self.expected_tags()
    }
}

/// Package the outcome of one turn loop.
pub fn assemble(
    question: &str,
    fragments: &[String],
    tool_calls: Vec<ToolCallRecord>,
    final_answer: Option<String>,
    termination: Termination,
    turns: u32,
) -> Trajectory {
    let transcript = fragments.join("\n");
    let cited_ids = extract_citations(&transcript);
    let tools_used = tool_calls
        .iter()
        .map(|call| call.tool_name.clone())
        .collect();

    Trajectory {
        question: question.to_string(),
        total_tool_calls: tool_calls.len(),
        transcript,
        tool_calls,
        final_answer: final_answer.unwrap_or_default(),
        tools_used,
        cited_ids,
        termination,
        turns,
    }
}

/// Keep oversized payloads as a bounded preview.
pub fn truncate_payload(value: Value, max_chars: usize) -> Value {
    let serialized = value.to_string();
    if serialized.chars().count() <= max_chars {
        return value;
    }
    json!({
        "truncated": true,
        "preview": preview(&serialized, max_chars),
    })
}
