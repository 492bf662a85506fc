//! Feedback invoker: hands a staged failure batch to the analysis collaborator.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::batch::FailureBatch;
use crate::core::locator::StagingLayout;
use crate::core::types::FeedbackReport;
use crate::error::ReflectError;
use crate::io::atomic::write_atomic;
use crate::io::prompt::render_analysis_prompt;
use crate::io::staging::write_feedback;
use crate::io::transform::{TextTransform, TransformRequest};

pub struct FeedbackInvoker<'a, T: TextTransform> {
    transform: &'a T,
    staging: StagingLayout,
    /// `<state>/feedback`, one `batch-<seq>.md` per analyzed batch.
    feedback_dir: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a, T: TextTransform> FeedbackInvoker<'a, T> {
    pub fn new(
        transform: &'a T,
        staging: StagingLayout,
        feedback_dir: PathBuf,
        workdir: PathBuf,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            transform,
            staging,
            feedback_dir,
            workdir,
            timeout,
            output_limit_bytes,
        }
    }

    /// Analyze `batch`. Every failure is reported as [`ReflectError::AnalysisFailure`]
    /// so the caller keeps the batch for a retry.
    #[instrument(skip_all, fields(batch_seq = batch.seq, failures = batch.len()))]
    pub fn analyze(&self, batch: &FailureBatch) -> Result<FeedbackReport> {
        self.try_analyze(batch).map_err(|err| {
            let reason = format!("{err:#}");
            warn!(reason = %reason, "analysis failed, batch retained");
            ReflectError::AnalysisFailure {
                batch_seq: batch.seq,
                reason,
            }
            .into()
        })
    }

    fn try_analyze(&self, batch: &FailureBatch) -> Result<FeedbackReport> {
        if batch.is_empty() {
            anyhow::bail!("batch is empty");
        }
        let output_path = self.feedback_dir.join(format!("batch-{}.md", batch.seq));
        match fs::remove_file(&output_path) {
            Ok(()) => info!(path = %output_path.display(), "removed stale report from earlier attempt"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove stale report {}", output_path.display()));
            }
        }

        let request = TransformRequest {
            workdir: self.workdir.clone(),
            instruction: render_analysis_prompt(batch, &self.staging, &output_path)?,
            output_path: output_path.clone(),
            log_path: self.feedback_dir.join(format!("batch-{}.log", batch.seq)),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        let body = self.transform.transform(&request)?;
        if body.trim().is_empty() {
            anyhow::bail!("collaborator returned an empty report");
        }
        write_atomic(&output_path, body.as_bytes())?;

        let job_ids = batch.job_ids();
        for job_id in &job_ids {
            if let Err(err) = write_feedback(&self.staging, job_id, &body) {
                warn!(job_id = %job_id, err = ?err, "failed to write job feedback");
            }
        }
        info!(jobs = job_ids.len(), path = %output_path.display(), "feedback report produced");
        Ok(FeedbackReport {
            batch_seq: batch.seq,
            job_ids,
            body,
            path: output_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TaskKey, TaskRecord, TaskStatus};
    use crate::test_support::{ScriptedStep, ScriptedTransform};
    use chrono::Utc;
    use std::path::Path;

    fn batch() -> FailureBatch {
        FailureBatch {
            seq: 2,
            entries: vec![
                TaskRecord::new(TaskKey::new("job-a", "1"), TaskStatus::Failure, Utc::now()),
                TaskRecord::new(TaskKey::new("job-b", "1"), TaskStatus::Failure, Utc::now()),
            ],
        }
    }

    fn invoker<'a>(root: &Path, transform: &'a ScriptedTransform) -> FeedbackInvoker<'a, ScriptedTransform> {
        FeedbackInvoker::new(
            transform,
            StagingLayout::new(root.join("failed-jobs")),
            root.join("state/feedback"),
            root.to_path_buf(),
            Duration::from_secs(5),
            10_000,
        )
    }

    #[test]
    fn report_is_persisted_and_fanned_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transform = ScriptedTransform::new(vec![ScriptedStep::Reply(
            "# Failure modes\n- skipped tests\n".to_string(),
        )]);
        let report = invoker(temp.path(), &transform)
            .analyze(&batch())
            .expect("analyze");

        assert_eq!(report.batch_seq, 2);
        assert_eq!(report.job_ids, vec!["job-a", "job-b"]);
        assert_eq!(report.path, temp.path().join("state/feedback/batch-2.md"));
        assert_eq!(fs::read_to_string(&report.path).expect("read"), report.body);
        for job in ["job-a", "job-b"] {
            let feedback = temp.path().join("failed-jobs").join(job).join("FEEDBACK.md");
            assert_eq!(fs::read_to_string(feedback).expect("read"), report.body);
        }
        let calls = transform.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].instruction.contains("Identify common failure modes"));
        assert_eq!(calls[0].output_path, report.path);
    }

    #[test]
    fn collaborator_error_is_analysis_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transform = ScriptedTransform::new(vec![ScriptedStep::Fail("timed out".to_string())]);
        let err = invoker(temp.path(), &transform)
            .analyze(&batch())
            .unwrap_err();
        match err.downcast_ref::<ReflectError>() {
            Some(ReflectError::AnalysisFailure { batch_seq, reason }) => {
                assert_eq!(*batch_seq, 2);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!temp.path().join("failed-jobs/job-a/FEEDBACK.md").exists());
    }

    #[test]
    fn blank_report_is_analysis_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transform = ScriptedTransform::new(vec![ScriptedStep::Reply("  \n".to_string())]);
        let err = invoker(temp.path(), &transform)
            .analyze(&batch())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReflectError>(),
            Some(ReflectError::AnalysisFailure { .. })
        ));
    }

    #[test]
    fn stale_report_is_not_reused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stale = temp.path().join("state/feedback/batch-2.md");
        fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        fs::write(&stale, "stale").expect("write");

        let transform = ScriptedTransform::new(vec![ScriptedStep::Fail("crash".to_string())]);
        invoker(temp.path(), &transform)
            .analyze(&batch())
            .unwrap_err();
        assert!(!stale.exists());
    }
}
