//! Question input and the append-only sample log.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::logging::{append_json_line, archive_file};
use crate::trajectory::Trajectory;

/// One input question. Unknown fields are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuestionItem {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            topic: None,
            question_type: None,
            id: None,
            extra: Map::new(),
        }
    }

    /// Source identifier rendered as a string (numeric ids are common).
    pub fn source_id(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Read questions from a JSONL file, skipping blank and malformed lines.
pub fn load_questions(path: impl AsRef<Path>) -> Result<Vec<QuestionItem>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open question file {}", path.display()))?;
    let mut items = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QuestionItem>(&line) {
            Ok(item) => items.push(item),
            Err(err) => {
                tracing::warn!(line = line_no + 1, %err, "skipping malformed question entry");
            }
        }
    }
    Ok(items)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Ok,
    Failed,
}

/// One line of the output log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: String,
    pub index: usize,
    pub status: SampleStatus,
    pub question: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub question_type: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub trajectory: Option<Trajectory>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

impl SampleRecord {
    pub fn sample_id_for(index: usize) -> String {
        format!("traj_{:05}", index + 1)
    }

    pub fn is_ok(&self) -> bool {
        self.status == SampleStatus::Ok
    }
}

/// Append-only JSONL log of finished samples.
#[derive(Debug, Clone)]
pub struct OutputLog {
    path: PathBuf,
}

impl OutputLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &SampleRecord) -> Result<()> {
        append_json_line(&self.path, record)
    }

    /// Move the log aside so the next run starts from an empty file.
    pub fn archive(&self) -> Result<Option<PathBuf>> {
        archive_file(&self.path)
    }

    /// Every parseable record in file order. A missing file is an empty log.
    pub fn load(&self) -> Result<Vec<SampleRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open output log {}", self.path.display()))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SampleRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::debug!(%err, "skipping malformed output record");
                }
            }
        }
        Ok(records)
    }

    /// Latest record per item index; later lines win.
    pub fn load_latest(&self) -> Result<BTreeMap<usize, SampleRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .map(|record| (record.index, record))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn record(index: usize, status: SampleStatus) -> SampleRecord {
        SampleRecord {
            sample_id: SampleRecord::sample_id_for(index),
            index,
            status,
            question: format!("question {index}"),
            topic: None,
            question_type: None,
            source_id: None,
            trajectory: None,
            error: None,
            attempts: 1,
            model: "test".into(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn questions_keep_extra_fields_and_skip_garbage() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("questions.jsonl");
        let mut file = File::create(&path)?;
        writeln!(file, r#"{{"question":"Q1","topic":"cardiology","id":12345,"difficulty":"hard"}}"#)?;
        writeln!(file)?;
        writeln!(file, "not json")?;
        writeln!(file, r#"{{"question":"Q2"}}"#)?;

        let items = load_questions(&path)?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].topic.as_deref(), Some("cardiology"));
        assert_eq!(items[0].source_id().as_deref(), Some("12345"));
        assert_eq!(items[0].extra["difficulty"], "hard");
        assert_eq!(items[1].source_id(), None);
        Ok(())
    }

    #[test]
    fn latest_record_per_index_wins() -> Result<()> {
        let temp = TempDir::new()?;
        let log = OutputLog::new(temp.path().join("out").join("samples.jsonl"));
        log.append(&record(0, SampleStatus::Failed))?;
        log.append(&record(1, SampleStatus::Ok))?;
        log.append(&record(0, SampleStatus::Ok))?;

        let latest = log.load_latest()?;
        assert_eq!(latest.len(), 2);
        assert!(latest[&0].is_ok());
        assert_eq!(log.load()?.len(), 3);
        Ok(())
    }

    #[test]
    fn archived_log_keeps_its_extension() -> Result<()> {
        let temp = TempDir::new()?;
        let log = OutputLog::new(temp.path().join("samples.jsonl"));
        assert!(log.archive()?.is_none());

        log.append(&record(0, SampleStatus::Ok))?;
        let backup = log.archive()?.expect("backup path");
        assert!(!log.path().exists());
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("samples_backup_"));
        assert!(name.ends_with(".jsonl"));
        Ok(())
    }

    #[test]
    fn missing_log_is_empty() -> Result<()> {
        let temp = TempDir::new()?;
        let log = OutputLog::new(temp.path().join("nothing.jsonl"));
        assert!(log.load_latest()?.is_empty());
        Ok(())
    }

    #[test]
    fn sample_ids_are_one_based_and_padded() {
        assert_eq!(SampleRecord::sample_id_for(0), "traj_00001");
        assert_eq!(SampleRecord::sample_id_for(41), "traj_00042");
    }
}
