//! Typed failure classes the loop reacts to.
//!
//! Most functions return `anyhow::Result`; these variants are attached where a
//! caller has to make a decision (retry, skip, halt) and are recovered with
//! `err.downcast_ref::<ReflectError>()`.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::TaskKey;

#[derive(Debug, Error)]
pub enum ReflectError {
    /// A marker or log could not be read (yet). Retried on the next scan.
    #[error("transient read failure on {path}: {reason}")]
    TransientIo { path: PathBuf, reason: String },

    /// A task was classified twice. Never expected in correct operation.
    #[error("task {key} is already marked processed")]
    DuplicateKey { key: TaskKey },

    /// Another process owns the processed index.
    #[error(
        "processed index is locked by pid {holder} ({lock}); remove the lock file if that process is gone"
    )]
    ConcurrentWriter { lock: PathBuf, holder: String },

    /// The analysis collaborator failed or returned nothing usable.
    #[error("analysis of batch {batch_seq} failed: {reason}")]
    AnalysisFailure { batch_seq: u64, reason: String },

    /// The revised behavior spec was rejected; the prior spec stays in place.
    #[error("revised behavior spec rejected: {}", .violations.join("; "))]
    InvalidSpec { violations: Vec<String> },

    /// The registry assigned a revision that does not follow the last one we saw.
    #[error("registry assigned revision {returned}, expected {expected} (another publisher?)")]
    RevisionConflict { returned: u64, expected: u64 },

    /// The registry push did not complete. Retried on the next pass.
    #[error("publish failed: {reason}")]
    PublishFailed { reason: String },
}

impl ReflectError {
    /// True for state-corruption errors that must stop the loop.
    pub fn halts_loop(&self) -> bool {
        matches!(
            self,
            ReflectError::DuplicateKey { .. }
                | ReflectError::ConcurrentWriter { .. }
                | ReflectError::RevisionConflict { .. }
        )
    }
}

/// True if `err` carries a [`ReflectError`] that must stop the loop.
pub fn is_halting(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ReflectError>()
        .is_some_and(ReflectError::halts_loop)
}
