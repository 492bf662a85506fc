//! Copies failure artifacts into `failed-jobs/` and writes per-job feedback.
//!
//! Copies are best-effort per file: a failed copy is reported in
//! [`StagedArtifacts::errors`] and never aborts ingestion of the record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::locator::{ArtifactPaths, StagingLayout};
use crate::core::types::TaskKey;
use crate::io::atomic::write_atomic;

/// What ended up in the staging area for one failed task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedArtifacts {
    /// Staged primary log, if present after staging.
    pub trajectory: Option<PathBuf>,
    /// Staged secondary log, if the source existed.
    pub test_result: Option<PathBuf>,
    pub errors: Vec<String>,
}

/// Outcome of copying a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyOutcome {
    Copied,
    /// Destination already staged by an earlier pass; left untouched.
    Kept,
    MissingSource,
    Failed,
}

impl CopyOutcome {
    fn is_present(self) -> bool {
        matches!(self, CopyOutcome::Copied | CopyOutcome::Kept)
    }
}

/// Stage the primary log (required) and secondary log (optional) for `key`.
pub fn stage_artifacts(
    layout: &StagingLayout,
    key: &TaskKey,
    artifacts: &ArtifactPaths,
) -> StagedArtifacts {
    let mut errors = Vec::new();

    let trajectory_dst = layout.trajectory_path(key);
    let trajectory = copy_without_overwrite(
        &artifacts.primary_log,
        &trajectory_dst,
        "trajectory",
        &mut errors,
    );
    if trajectory == CopyOutcome::MissingSource {
        errors.push(format!(
            "trajectory: missing {}",
            artifacts.primary_log.display()
        ));
    }

    let test_result_dst = layout.test_result_path(key);
    let test_result = copy_without_overwrite(
        &artifacts.secondary_log,
        &test_result_dst,
        "test result",
        &mut errors,
    );

    if !errors.is_empty() {
        warn!(job_id = %key.job_id, task_id = %key.task_id, errors = ?errors, "artifact staging had errors");
    }
    debug!(job_id = %key.job_id, task_id = %key.task_id, ?trajectory, ?test_result, "artifacts staged");

    StagedArtifacts {
        trajectory: trajectory.is_present().then_some(trajectory_dst),
        test_result: test_result.is_present().then_some(test_result_dst),
        errors,
    }
}

/// Write `failed-jobs/<job_id>/FEEDBACK.md`, replacing any previous report.
pub fn write_feedback(layout: &StagingLayout, job_id: &str, body: &str) -> Result<PathBuf> {
    let path = layout.feedback_path(job_id);
    write_atomic(&path, body.as_bytes())
        .with_context(|| format!("write feedback for job {job_id}"))?;
    debug!(job_id, path = %path.display(), "feedback written");
    Ok(path)
}

fn copy_without_overwrite(
    src: &Path,
    dst: &Path,
    label: &str,
    errors: &mut Vec<String>,
) -> CopyOutcome {
    if dst.exists() {
        return CopyOutcome::Kept;
    }
    if !src.exists() {
        return CopyOutcome::MissingSource;
    }
    if let Some(parent) = dst.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        errors.push(format!("{label}: create dir failed: {err}"));
        return CopyOutcome::Failed;
    }
    match fs::copy(src, dst) {
        Ok(_) => CopyOutcome::Copied,
        Err(err) => {
            errors.push(format!("{label}: copy failed: {err}"));
            CopyOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::locator::ArtifactLocator;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn stages_both_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locator = ArtifactLocator::new(temp.path().join("jobs"));
        let layout = StagingLayout::new(temp.path().join("failed-jobs"));
        let key = TaskKey::new("job", "task");
        let paths = locator.locate(&key);
        write(&paths.primary_log, "agent said hi");
        write(&paths.secondary_log, "1 failed");

        let staged = stage_artifacts(&layout, &key, &paths);
        assert!(staged.errors.is_empty());
        assert_eq!(
            fs::read_to_string(layout.trajectory_path(&key)).expect("read"),
            "agent said hi"
        );
        assert_eq!(
            fs::read_to_string(layout.test_result_path(&key)).expect("read"),
            "1 failed"
        );
        assert_eq!(staged.test_result, Some(layout.test_result_path(&key)));
    }

    #[test]
    fn missing_secondary_log_is_silent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locator = ArtifactLocator::new(temp.path().join("jobs"));
        let layout = StagingLayout::new(temp.path().join("failed-jobs"));
        let key = TaskKey::new("job", "task");
        let paths = locator.locate(&key);
        write(&paths.primary_log, "trajectory");

        let staged = stage_artifacts(&layout, &key, &paths);
        assert!(staged.errors.is_empty());
        assert!(staged.trajectory.is_some());
        assert_eq!(staged.test_result, None);
    }

    #[test]
    fn missing_primary_log_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locator = ArtifactLocator::new(temp.path().join("jobs"));
        let layout = StagingLayout::new(temp.path().join("failed-jobs"));
        let key = TaskKey::new("job", "task");
        let paths = locator.locate(&key);
        write(&paths.secondary_log, "tests");

        let staged = stage_artifacts(&layout, &key, &paths);
        assert_eq!(staged.errors.len(), 1);
        assert!(staged.errors[0].starts_with("trajectory: missing"));
        assert!(staged.test_result.is_some(), "secondary copy still happens");
    }

    #[test]
    fn existing_staged_file_is_not_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locator = ArtifactLocator::new(temp.path().join("jobs"));
        let layout = StagingLayout::new(temp.path().join("failed-jobs"));
        let key = TaskKey::new("job", "task");
        let paths = locator.locate(&key);
        write(&paths.primary_log, "new");
        write(&layout.trajectory_path(&key), "original");

        let staged = stage_artifacts(&layout, &key, &paths);
        assert!(staged.errors.is_empty());
        assert_eq!(
            fs::read_to_string(layout.trajectory_path(&key)).expect("read"),
            "original"
        );
    }

    #[test]
    fn feedback_lands_in_job_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = StagingLayout::new(temp.path().join("failed-jobs"));
        let path = write_feedback(&layout, "job-1", "# modes\n").expect("write");
        assert_eq!(path, temp.path().join("failed-jobs/job-1/FEEDBACK.md"));
        assert_eq!(fs::read_to_string(path).expect("read"), "# modes\n");
    }
}
