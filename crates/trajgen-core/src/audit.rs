use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::sink::SampleRecord;
use crate::trajectory::Trajectory;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ToolTally {
    pub succeeded: usize,
    pub failed: usize,
}

/// Where trajectories without an answer stopped.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MissingAnswerTally {
    pub ended_on_tool_output: usize,
    pub unclosed_think: usize,
    pub unclosed_call: usize,
    pub other: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AuditReport {
    pub total_records: usize,
    pub malformed_lines: usize,
    pub failed_records: usize,
    pub records_with_tool_calls: usize,
    pub all_calls_succeeded: usize,
    pub at_most_one_failed_call: usize,
    pub ill_formed: usize,
    pub answered: usize,
    pub missing_answer: MissingAnswerTally,
    pub per_tool: BTreeMap<String, ToolTally>,
    pub terminations: BTreeMap<String, usize>,
}

impl AuditReport {
    pub fn record(&mut self, sample: &SampleRecord) {
        self.total_records += 1;
        if !sample.is_ok() {
            self.failed_records += 1;
        }
        if let Some(trajectory) = &sample.trajectory {
            self.record_trajectory(trajectory);
        }
    }

    fn record_trajectory(&mut self, trajectory: &Trajectory) {
        *self
            .terminations
            .entry(trajectory.termination.as_str().to_string())
            .or_insert(0) += 1;
        if !trajectory.is_well_formed() {
            self.ill_formed += 1;
        }

        if !trajectory.tool_calls.is_empty() {
            self.records_with_tool_calls += 1;
            let mut failures = 0;
            for call in &trajectory.tool_calls {
                let tally = self.per_tool.entry(call.tool_name.clone()).or_default();
                if call.succeeded() {
                    tally.succeeded += 1;
                } else {
                    tally.failed += 1;
                    failures += 1;
                }
            }
            if failures == 0 {
                self.all_calls_succeeded += 1;
            }
            if failures <= 1 {
                self.at_most_one_failed_call += 1;
            }
        }

        if trajectory.transcript.contains("<answer") {
            self.answered += 1;
            return;
        }
        let transcript = trajectory.transcript.trim_end();
        if transcript.ends_with("</tool_output>") {
            self.missing_answer.ended_on_tool_output += 1;
        } else if unclosed(transcript, "<think>", "</think>") {
            self.missing_answer.unclosed_think += 1;
        } else if unclosed(transcript, "<call_tool", "</call_tool>") {
            self.missing_answer.unclosed_call += 1;
        } else {
            self.missing_answer.other += 1;
        }
    }

    pub fn missing_answers(&self) -> usize {
        let tally = &self.missing_answer;
        tally.ended_on_tool_output + tally.unclosed_think + tally.unclosed_call + tally.other
    }

    pub fn summary(&self) -> String {
        format!(
            "{} record(s) • {} with tool calls • {} all-success • {} without answer • {} malformed line(s)",
            self.total_records,
            self.records_with_tool_calls,
            self.all_calls_succeeded,
            self.missing_answers(),
            self.malformed_lines
        )
    }

    pub fn render_markdown(&self, top: usize) -> String {
        let mut output = String::from("### Dataset Audit\n");
        let _ = writeln!(output, "{}", self.summary());
        let _ = writeln!(
            output,
            "- failed records: {}\n- ill-formed transcripts: {}\n- at most one failed call: {}",
            self.failed_records, self.ill_formed, self.at_most_one_failed_call
        );

        let mut tools: Vec<_> = self.per_tool.iter().collect();
        tools.sort_by(|a, b| {
            (b.1.failed + b.1.succeeded)
                .cmp(&(a.1.failed + a.1.succeeded))
                .then_with(|| a.0.cmp(b.0))
        });
        if !tools.is_empty() {
            output.push_str("\n#### Tool calls\n");
            for (name, tally) in tools.into_iter().take(top) {
                let _ = writeln!(
                    output,
                    "- {name}: {} ok / {} failed",
                    tally.succeeded, tally.failed
                );
            }
        }

        if self.missing_answers() > 0 {
            let tally = &self.missing_answer;
            let _ = writeln!(
                output,
                "\n#### Missing answers\n- ended on tool output: {}\n- unclosed think: {}\n- unclosed call: {}\n- other: {}",
                tally.ended_on_tool_output, tally.unclosed_think, tally.unclosed_call, tally.other
            );
        }
        output
    }
}

fn unclosed(text: &str, open: &str, close: &str) -> bool {
    let last_open = text.rfind(open);
    last_open.is_some() && last_open > text.rfind(close)
}

pub struct DatasetAudit;

impl DatasetAudit {
    pub fn analyze_log(path: impl AsRef<Path>) -> Result<AuditReport> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open sample log {}", path.as_ref().display()))?;
        let mut report = AuditReport::default();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SampleRecord>(&line) {
                Ok(sample) => report.record(&sample),
                Err(err) => {
                    report.malformed_lines += 1;
                    tracing::debug!(%err, "skipping malformed sample entry");
                }
            }
        }

        Ok(report)
    }
}
