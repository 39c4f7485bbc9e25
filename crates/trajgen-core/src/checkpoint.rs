//! Batch progress checkpoints and resume planning.
//!
//! The checkpoint only records progress. Generated samples live in the
//! append-only [`OutputLog`](crate::OutputLog), and resume decisions are a pure
//! function of both, so re-running a finished plan does nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logging::archive_file;
use crate::sink::SampleRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub total_items: usize,
    /// Items handled since the checkpoint was created, retries included.
    pub processed_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub completed_indices: BTreeSet<usize>,
    pub failed_indices: BTreeSet<usize>,
    /// Output log holding the samples this checkpoint accounts for.
    pub output_path: PathBuf,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(total_items: usize, output_path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            total_items,
            processed_count: 0,
            success_count: 0,
            failure_count: 0,
            completed_indices: BTreeSet::new(),
            failed_indices: BTreeSet::new(),
            output_path: output_path.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn record_success(&mut self, index: usize) {
        self.processed_count += 1;
        self.failed_indices.remove(&index);
        self.completed_indices.insert(index);
        self.refresh_counts();
    }

    pub fn record_failure(&mut self, index: usize) {
        self.processed_count += 1;
        if !self.completed_indices.contains(&index) {
            self.failed_indices.insert(index);
        }
        self.refresh_counts();
    }

    /// Fold in outcomes the output log knows about but this checkpoint missed,
    /// e.g. after a crash between an append and the next save.
    pub fn reconcile(&mut self, records: &BTreeMap<usize, SampleRecord>) {
        for (index, record) in records {
            if record.is_ok() {
                self.failed_indices.remove(index);
                self.completed_indices.insert(*index);
            } else if !self.completed_indices.contains(index) {
                self.failed_indices.insert(*index);
            }
        }
        self.refresh_counts();
    }

    pub fn is_complete(&self) -> bool {
        self.failed_indices.is_empty()
            && (0..self.total_items).all(|index| self.completed_indices.contains(&index))
    }

    fn refresh_counts(&mut self) {
        self.success_count = self.completed_indices.len();
        self.failure_count = self.failed_indices.len();
        self.updated_at = Utc::now();
    }
}

/// Order in which a (re)started batch processes items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePlan {
    /// Previously failed items, retried first.
    pub retry: Vec<usize>,
    /// Items never attempted.
    pub pending: Vec<usize>,
    /// Items already completed and skipped.
    pub skipped: usize,
}

impl ResumePlan {
    pub fn build(
        total_items: usize,
        checkpoint: Option<&Checkpoint>,
        records: &BTreeMap<usize, SampleRecord>,
    ) -> Self {
        let mut completed: BTreeSet<usize> = records
            .iter()
            .filter(|(_, record)| record.is_ok())
            .map(|(index, _)| *index)
            .collect();
        let mut failed: BTreeSet<usize> = records
            .iter()
            .filter(|(_, record)| !record.is_ok())
            .map(|(index, _)| *index)
            .collect();
        if let Some(checkpoint) = checkpoint {
            completed.extend(checkpoint.completed_indices.iter().copied());
            failed.extend(checkpoint.failed_indices.iter().copied());
        }

        let retry: Vec<usize> = failed
            .iter()
            .copied()
            .filter(|index| *index < total_items && !completed.contains(index))
            .collect();
        let pending = (0..total_items)
            .filter(|index| !completed.contains(index) && !failed.contains(index))
            .collect();
        let skipped = completed.iter().filter(|index| **index < total_items).count();

        Self {
            retry,
            pending,
            skipped,
        }
    }

    pub fn order(&self) -> Vec<usize> {
        self.retry.iter().chain(self.pending.iter()).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.retry.is_empty() && self.pending.is_empty()
    }
}

/// Checkpoint persistence with atomic replacement.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read checkpoint {}", self.path.display()))?;
        let checkpoint = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse checkpoint {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Write to a sibling temp file, then rename over the previous checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create checkpoint directory {}", parent.display())
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(checkpoint)?;
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create checkpoint file {}", tmp.display()))?;
            file.write_all(&payload)
                .with_context(|| format!("failed to write checkpoint file {}", tmp.display()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace checkpoint {}", self.path.display()))?;
        Ok(())
    }

    /// Move the checkpoint aside as `<stem>_backup_<timestamp>.json`.
    pub fn archive(&self) -> Result<Option<PathBuf>> {
        archive_file(&self.path)
    }
}
