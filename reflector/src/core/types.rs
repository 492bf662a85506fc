//! Shared record types.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite key of a task within the job tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub job_id: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(job_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.task_id)
    }
}

/// Classification of a task from its completion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    /// Marker missing, empty, non-numeric or unreadable. Never persisted.
    Incomplete,
}

/// One classification produced by the scanner.
///
/// Success and failure records are persisted in the processed index and never
/// rewritten. Incomplete records only live for the pass that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub key: TaskKey,
    pub status: TaskStatus,
    pub classified_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(key: TaskKey, status: TaskStatus, classified_at: DateTime<Utc>) -> Self {
        Self {
            key,
            status,
            classified_at,
        }
    }
}

/// Report produced by the analysis collaborator for one drained batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackReport {
    pub batch_seq: u64,
    /// Jobs covered by the batch, in first-seen order.
    pub job_ids: Vec<String>,
    pub body: String,
    /// Where the report was persisted (`<state>/feedback/batch-<seq>.md`).
    pub path: PathBuf,
}

/// A revision accepted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubRevision {
    pub name: String,
    pub branch: String,
    pub revision: u64,
    /// Revision of the behavior spec document that was published.
    pub spec_revision: u64,
    pub spec_sha256: String,
    pub published_at: DateTime<Utc>,
}
