//! Failure batch state and threshold trigger.
//!
//! The batch is an explicit state object owned by the aggregator. It records
//! failures in discovery order and reports readiness once the configured
//! threshold is reached. Readiness holds until [`BatchState::drain`].

use serde::{Deserialize, Serialize};

use crate::core::types::{TaskKey, TaskRecord, TaskStatus};

/// Default number of failures that triggers analysis.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 10;

/// Failures collected since the last successful analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBatch {
    /// Sequence number of this batch (1-indexed, increments on every drain).
    pub seq: u64,
    pub entries: Vec<TaskRecord>,
}

impl FailureBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Job ids in first-seen order.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !ids.contains(&entry.key.job_id) {
                ids.push(entry.key.job_id.clone());
            }
        }
        ids
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries.iter().any(|entry| &entry.key == key)
    }
}

/// Result of offering a record to the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Added,
    /// The key is already queued (e.g. re-ingested after a crash).
    AlreadyQueued,
    /// Only failure records are batched.
    NotAFailure,
}

/// Threshold state machine over a [`FailureBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchState {
    threshold: usize,
    batch: FailureBatch,
}

impl BatchState {
    pub fn new(threshold: usize) -> Self {
        Self::restore(
            threshold,
            FailureBatch {
                seq: 1,
                entries: Vec::new(),
            },
        )
    }

    /// Rebuild state from a persisted batch.
    pub fn restore(threshold: usize, batch: FailureBatch) -> Self {
        let seq = batch.seq.max(1);
        Self {
            threshold: threshold.max(1),
            batch: FailureBatch { seq, ..batch },
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn batch(&self) -> &FailureBatch {
        &self.batch
    }

    pub fn push(&mut self, record: TaskRecord) -> PushOutcome {
        if record.status != TaskStatus::Failure {
            return PushOutcome::NotAFailure;
        }
        if self.batch.contains(&record.key) {
            return PushOutcome::AlreadyQueued;
        }
        self.batch.entries.push(record);
        PushOutcome::Added
    }

    pub fn is_ready(&self) -> bool {
        self.batch.len() >= self.threshold
    }

    /// Take the current batch and start the next one.
    pub fn drain(&mut self) -> FailureBatch {
        let next = FailureBatch {
            seq: self.batch.seq + 1,
            entries: Vec::new(),
        };
        std::mem::replace(&mut self.batch, next)
    }
}
