//! Persisted loop state (`<state>/loop_state.json`).
//!
//! Holds everything the orchestrator needs to resume after a restart that is
//! not already in the processed index: the open failure batch, how much of the
//! index the batch already reflects, the last registry revision we observed,
//! and a publish that was accepted locally but never reached the registry.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::batch::FailureBatch;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopState {
    /// Failures collected since the last successful analysis.
    pub batch: FailureBatch,
    /// Processed index entries already reflected in `batch`. Failures past this
    /// point were marked but not batched before a crash and are re-ingested.
    pub accounted: usize,
    /// Last revision number observed in the registry (0 = none).
    pub last_revision: u64,
    /// Spec revision written locally but not yet published.
    pub pending_publish: Option<u64>,
    /// Completed passes across all runs.
    pub passes: u64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            batch: FailureBatch {
                seq: 1,
                entries: Vec::new(),
            },
            accounted: 0,
            last_revision: 0,
            pending_publish: None,
            passes: 0,
        }
    }
}

pub fn load_loop_state(path: &Path) -> Result<LoopState> {
    debug!(path = %path.display(), "loading loop state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read loop state {}", path.display()))?;
    let state: LoopState = serde_json::from_str(&contents)
        .with_context(|| format!("parse loop state {}", path.display()))?;
    debug!(
        batch_seq = state.batch.seq,
        pending = state.batch.len(),
        last_revision = state.last_revision,
        "loop state loaded"
    );
    Ok(state)
}

/// Load loop state, or start fresh if the file does not exist yet.
pub fn load_or_default(path: &Path) -> Result<LoopState> {
    if path.exists() {
        load_loop_state(path)
    } else {
        debug!(path = %path.display(), "no loop state, starting fresh");
        Ok(LoopState::default())
    }
}

/// Atomically write loop state (temp file + rename).
pub fn write_loop_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(
        path = %path.display(),
        batch_seq = state.batch.seq,
        pending = state.batch.len(),
        "writing loop state"
    );
    write_json_atomic(path, state)
}
