use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

use crate::markup::ToolParams;

const PREVIEW_CHARS: usize = 500;

static REDACTION_PATTERNS: Lazy<Vec<(String, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key".to_string(),
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret".to_string(),
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer".to_string(),
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token".to_string(),
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Rename `path` to `<stem>_backup_<timestamp>.<ext>` in the same directory.
pub(crate) fn archive_file(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let mut backup_name = format!("{stem}_backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    if let Some(ext) = path.extension() {
        backup_name.push('.');
        backup_name.push_str(&ext.to_string_lossy());
    }
    let backup = path.with_file_name(backup_name);
    std::fs::rename(path, &backup)
        .with_context(|| format!("failed to archive {}", path.display()))?;
    Ok(Some(backup))
}

pub(crate) fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.clone());
        }
    }
    output
}

/// Truncate on a char boundary.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// One dispatched call as seen by the diagnostic log.
#[derive(Debug, Clone)]
pub struct ToolCallEntry<'a> {
    pub tool: &'a str,
    pub query: &'a str,
    pub params: &'a ToolParams,
    pub status: &'a str,
    pub error: Option<String>,
    pub result: Option<&'a Value>,
    pub attempts: u32,
    pub latency_ms: u64,
}

#[derive(Serialize)]
struct ToolCallRecordLine<'a> {
    timestamp: String,
    sequence: usize,
    tool: &'a str,
    query: String,
    params: &'a ToolParams,
    status: &'a str,
    error: Option<String>,
    result_preview: Option<String>,
    attempts: u32,
    latency_ms: u64,
    redactions: Vec<String>,
}

/// Diagnostic JSONL log of the first `limit` tool calls.
///
/// The counter belongs to the instance, so independent runs (and tests) never
/// share a cap.
#[derive(Debug)]
pub struct ToolCallLog {
    path: PathBuf,
    limit: usize,
    sequence: AtomicUsize,
    write_lock: Mutex<()>,
}

impl ToolCallLog {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit,
            sequence: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entry` unless the cap was reached. Returns whether a line was written.
    pub fn record(&self, entry: &ToolCallEntry<'_>) -> Result<bool> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        if sequence >= self.limit {
            return Ok(false);
        }

        let mut redactions = BTreeSet::new();
        let query = sanitize_text(entry.query, &mut redactions);
        let error = entry
            .error
            .as_deref()
            .map(|value| sanitize_text(value, &mut redactions));
        let result_preview = entry.result.map(|value| {
            sanitize_text(&preview(&value.to_string(), PREVIEW_CHARS), &mut redactions)
        });

        let line = ToolCallRecordLine {
            timestamp: Utc::now().to_rfc3339(),
            sequence: sequence + 1,
            tool: entry.tool,
            query,
            params: entry.params,
            status: entry.status,
            error,
            result_preview,
            attempts: entry.attempts,
            latency_ms: entry.latency_ms,
            redactions: redactions.iter().cloned().collect(),
        };

        if !line.redactions.is_empty() {
            warn!(
                tool = entry.tool,
                fields = ?line.redactions,
                "redacted potential secrets from tool call log"
            );
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("tool call log lock poisoned"))?;
        append_json_line(&self.path, &line)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry<'a>(params: &'a ToolParams, result: &'a Value) -> ToolCallEntry<'a> {
        ToolCallEntry {
            tool: "google_search",
            query: "api_key=abcd1234 lithium",
            params,
            status: "ok",
            error: None,
            result: Some(result),
            attempts: 1,
            latency_ms: 12,
        }
    }

    #[test]
    fn call_log_redacts_and_caps() -> Result<()> {
        let temp = TempDir::new()?;
        let log = ToolCallLog::new(temp.path().join("calls.jsonl"), 2);
        let params = ToolParams::new();
        let result = json!({ "organic": [] });

        assert!(log.record(&entry(&params, &result))?);
        assert!(log.record(&entry(&params, &result))?);
        assert!(!log.record(&entry(&params, &result))?);

        let contents = std::fs::read_to_string(log.path())?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["sequence"], 1);
        assert!(first["query"].as_str().unwrap().contains("[REDACTED]"));
        assert_eq!(first["redactions"], json!(["api_key"]));
        Ok(())
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé…");
        assert_eq!(preview("hi", 5), "hi");
    }
}
