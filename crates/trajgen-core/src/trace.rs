use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::logging::preview;
use crate::trajectory::Trajectory;

const STEP_PREVIEW_CHARS: usize = 80;

static SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)<think>(.*?)</think>|<call_tool\b([^>]*)>([^<]*)</call_tool>|<tool_output>(.*?)</tool_output>|<answer\s*>(.*?)</answer>",
    )
    .expect("invalid transcript segment regex")
});
static TOOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"name\s*=\s*"([^"]*)""#).expect("invalid tool name regex"));
static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("invalid whitespace regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptStep {
    Reasoning { text: String },
    Call { tool: String, query: String },
    Result { preview: String },
    Answer { text: String },
    Note { text: String },
}

impl TranscriptStep {
    fn label(&self) -> String {
        match self {
            Self::Reasoning { text } => format!("think → {text}"),
            Self::Call { tool, query } => format!("call {tool} → {query}"),
            Self::Result { preview } => format!("result → {preview}"),
            Self::Answer { text } => format!("answer → {text}"),
            Self::Note { text } => format!("text → {text}"),
        }
    }
}

/// Human-readable outline of one trajectory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub question: String,
    pub termination: String,
    pub turns: u32,
    pub tool_calls: usize,
    pub cited_ids: Vec<String>,
    pub steps: Vec<TranscriptStep>,
}

impl TranscriptSummary {
    pub fn from_trajectory(trajectory: &Trajectory) -> Self {
        Self {
            question: trajectory.question.clone(),
            termination: trajectory.termination.as_str().to_string(),
            turns: trajectory.turns,
            tool_calls: trajectory.total_tool_calls,
            cited_ids: trajectory.cited_ids.iter().cloned().collect(),
            steps: split_steps(&trajectory.transcript),
        }
    }

    pub fn render_markdown(&self) -> String {
        let mut output = String::from("### Trajectory Summary\n");
        let _ = writeln!(output, "**Question:** {}", self.question);
        let _ = writeln!(
            output,
            "**Termination:** {} • {} turn(s) • {} tool call(s)",
            self.termination, self.turns, self.tool_calls
        );
        output.push('\n');

        if self.steps.is_empty() {
            output.push_str("No transcript recorded.\n");
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let _ = writeln!(output, "{}. {}", idx + 1, step.label());
        }

        if !self.cited_ids.is_empty() {
            let _ = write!(output, "\n**Cited:** {}\n", self.cited_ids.join(", "));
        }
        output
    }
}

fn compact(text: &str) -> String {
    let single_line = WHITESPACE.replace_all(text.trim(), " ");
    preview(&single_line, STEP_PREVIEW_CHARS)
}

fn push_note(steps: &mut Vec<TranscriptStep>, text: &str) {
    if !text.trim().is_empty() {
        steps.push(TranscriptStep::Note {
            text: compact(text),
        });
    }
}

fn split_steps(transcript: &str) -> Vec<TranscriptStep> {
    let mut steps = Vec::new();
    let mut cursor = 0;
    for caps in SEGMENT.captures_iter(transcript) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_note(&mut steps, &transcript[cursor..whole.start()]);
        cursor = whole.end();

        let step = if let Some(text) = caps.get(1) {
            TranscriptStep::Reasoning {
                text: compact(text.as_str()),
            }
        } else if let Some(attrs) = caps.get(2) {
            let tool = TOOL_NAME
                .captures(attrs.as_str())
                .map(|name| name[1].to_string())
                .unwrap_or_default();
            TranscriptStep::Call {
                tool,
                query: compact(caps.get(3).map(|m| m.as_str()).unwrap_or_default()),
            }
        } else if let Some(body) = caps.get(4) {
            TranscriptStep::Result {
                preview: compact(body.as_str()),
            }
        } else {
            TranscriptStep::Answer {
                text: compact(caps.get(5).map(|m| m.as_str()).unwrap_or_default()),
            }
        };
        steps.push(step);
    }
    push_note(&mut steps, &transcript[cursor..]);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::ToolInvocation;
    use crate::trajectory::{Termination, ToolCallRecord, assemble};
    use serde_json::json;

    #[test]
    fn markdown_renders_steps() {
        let call = ToolInvocation::new("pubmed_search", "X Y Z trial");
        let fragments = vec![
            "<think>Need trial data</think>\n<call_tool name=\"pubmed_search\" limit=\"5\">X Y Z trial</call_tool>".to_string(),
            "<tool_output>Found 2 results. Showing top 2:</tool_output>".to_string(),
            "<answer>Effective <cite id=\"111\">a</cite> <cite id=\"222\">b</cite></answer>".to_string(),
        ];
        let trajectory = assemble(
            "Does X work?",
            &fragments,
            vec![ToolCallRecord::new(call, json!({}))],
            Some("Effective".into()),
            Termination::Answered,
            2,
        );

        let summary = TranscriptSummary::from_trajectory(&trajectory);
        insta::assert_snapshot!(summary.render_markdown(), @r###"
### Trajectory Summary
**Question:** Does X work?
**Termination:** answered • 2 turn(s) • 1 tool call(s)

1. think → Need trial data
2. call pubmed_search → X Y Z trial
3. result → Found 2 results. Showing top 2:
4. answer → Effective <cite id="111">a</cite> <cite id="222">b</cite>

**Cited:** 111, 222
"###);
    }

    #[test]
    fn stray_text_becomes_notes() {
        let steps = split_steps("plain reasoning without tags\n<answer>42</answer>");
        assert_eq!(
            steps,
            vec![
                TranscriptStep::Note {
                    text: "plain reasoning without tags".into()
                },
                TranscriptStep::Answer { text: "42".into() },
            ]
        );
    }

    #[test]
    fn empty_transcript_is_reported() {
        let summary = TranscriptSummary::default();
        assert!(summary.render_markdown().contains("No transcript recorded."));
    }
}
