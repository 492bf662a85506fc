//! Failure aggregation: stage artifacts and feed the batch state machine.

use tracing::{debug, info, warn};

use crate::core::batch::{BatchState, FailureBatch, PushOutcome};
use crate::core::locator::{ArtifactPaths, StagingLayout};
use crate::core::types::TaskRecord;
use crate::io::staging::{StagedArtifacts, stage_artifacts};

/// Result of ingesting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub outcome: PushOutcome,
    pub staged: StagedArtifacts,
    pub batch_len: usize,
}

/// Owns the open failure batch and the staging area.
#[derive(Debug, Clone)]
pub struct Aggregator {
    state: BatchState,
    staging: StagingLayout,
}

impl Aggregator {
    pub fn new(state: BatchState, staging: StagingLayout) -> Self {
        Self { state, staging }
    }

    pub fn staging(&self) -> &StagingLayout {
        &self.staging
    }

    /// Stage the failure's artifacts and append it to the batch.
    ///
    /// Staging errors are reported in the result; they never prevent the
    /// record from joining the batch.
    pub fn ingest(&mut self, record: TaskRecord, artifacts: &ArtifactPaths) -> IngestReport {
        let key = record.key.clone();
        let outcome = self.state.push(record);
        let staged = match outcome {
            PushOutcome::Added | PushOutcome::AlreadyQueued => {
                stage_artifacts(&self.staging, &key, artifacts)
            }
            PushOutcome::NotAFailure => {
                warn!(job_id = %key.job_id, task_id = %key.task_id, "ignoring non-failure record");
                StagedArtifacts::default()
            }
        };
        let batch_len = self.state.len();
        debug!(job_id = %key.job_id, task_id = %key.task_id, ?outcome, batch_len, "failure ingested");
        if outcome == PushOutcome::Added && batch_len == self.state.threshold() {
            info!(batch_seq = self.state.batch().seq, batch_len, "failure batch ready for analysis");
        }
        IngestReport {
            outcome,
            staged,
            batch_len,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.state.threshold()
    }

    pub fn batch(&self) -> &FailureBatch {
        self.state.batch()
    }

    /// Take the current batch and start the next one.
    pub fn drain(&mut self) -> FailureBatch {
        let drained = self.state.drain();
        info!(batch_seq = drained.seq, drained = drained.len(), "failure batch drained");
        drained
    }
}
