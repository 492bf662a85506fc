//! Behavior spec updater: the collaborator revises a work copy, which is
//! validated before it replaces the canonical document.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::behavior_spec::{BehaviorSpec, check_shape_preserved, parse_spec, render_spec};
use crate::core::types::FeedbackReport;
use crate::error::ReflectError;
use crate::io::atomic::write_atomic;
use crate::io::prompt::{UpdatePromptInputs, render_update_prompt};
use crate::io::spec_store::write_spec;
use crate::io::transform::{TextTransform, TransformRequest};

pub struct SpecUpdater<'a, T: TextTransform> {
    transform: &'a T,
    /// Canonical behavior spec.
    spec_path: PathBuf,
    /// Scratch directory for the collaborator's work copy.
    scratch_dir: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a, T: TextTransform> SpecUpdater<'a, T> {
    pub fn new(
        transform: &'a T,
        spec_path: PathBuf,
        scratch_dir: PathBuf,
        workdir: PathBuf,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            transform,
            spec_path,
            scratch_dir,
            workdir,
            timeout,
            output_limit_bytes,
        }
    }

    /// Apply `report` to `current`.
    ///
    /// On success the returned spec has revision `current.revision + 1` and has
    /// been written to the canonical path. On [`ReflectError::InvalidSpec`] the
    /// canonical document is untouched.
    #[instrument(skip_all, fields(batch_seq = report.batch_seq, revision = current.revision))]
    pub fn apply(&self, report: &FeedbackReport, current: &BehaviorSpec) -> Result<BehaviorSpec> {
        let work_path = self
            .scratch_dir
            .join(format!("behavior_spec.batch-{}.toml", report.batch_seq));
        write_atomic(&work_path, render_spec(current)?.as_bytes())?;

        let request = TransformRequest {
            workdir: self.workdir.clone(),
            instruction: render_update_prompt(&UpdatePromptInputs {
                spec: current,
                spec_path: &work_path,
                feedback_path: &report.path,
                batch_seq: report.batch_seq,
            })?,
            output_path: work_path.clone(),
            log_path: self
                .scratch_dir
                .join(format!("update.batch-{}.log", report.batch_seq)),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };

        let revised = match self.transform.transform(&request) {
            Ok(text) => text,
            Err(err) => return Err(reject(vec![format!("collaborator failed: {err:#}")])),
        };
        let mut next = match parse_spec(&revised) {
            Ok(spec) => spec,
            Err(err) => return Err(reject(vec![format!("{err:#}")])),
        };
        let violations = check_shape_preserved(current, &next);
        if !violations.is_empty() {
            return Err(reject(violations));
        }
        if next.same_content(current) {
            return Err(reject(vec!["revision made no changes".to_string()]));
        }

        next.revision = current.revision + 1;
        write_spec(&self.spec_path, &next)?;
        info!(from = current.revision, to = next.revision, "behavior spec updated");
        Ok(next)
    }
}

fn reject(violations: Vec<String>) -> anyhow::Error {
    warn!(violations = ?violations, "revised spec rejected, keeping current");
    ReflectError::InvalidSpec { violations }.into()
}
