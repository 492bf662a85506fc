//! Artifact layout for the job tree and the staging area.
//!
//! Pure path computation: nothing here touches the filesystem, and every path
//! is returned whether or not the file exists yet.

use std::path::{Path, PathBuf};

use crate::core::types::TaskKey;

/// Expected artifact paths for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub task_dir: PathBuf,
    /// `verifier/reward.txt`
    pub completion_marker: PathBuf,
    /// `agent/command-0/stdout.txt` (agent trajectory)
    pub primary_log: PathBuf,
    /// `verifier/test-stdout.txt` (test output)
    pub secondary_log: PathBuf,
}

/// Resolves artifact paths under `jobs/<job_id>/<task_id>/`.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    jobs_root: PathBuf,
}

impl ArtifactLocator {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
        }
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    pub fn locate(&self, key: &TaskKey) -> ArtifactPaths {
        let task_dir = self.jobs_root.join(&key.job_id).join(&key.task_id);
        let verifier = task_dir.join("verifier");
        ArtifactPaths {
            completion_marker: verifier.join("reward.txt"),
            secondary_log: verifier.join("test-stdout.txt"),
            primary_log: task_dir.join("agent").join("command-0").join("stdout.txt"),
            task_dir,
        }
    }
}

/// Staging layout under `failed-jobs/`.
#[derive(Debug, Clone)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, key: &TaskKey) -> PathBuf {
        self.root.join(&key.job_id).join(&key.task_id)
    }

    pub fn trajectory_path(&self, key: &TaskKey) -> PathBuf {
        self.task_dir(key).join("trajectory.txt")
    }

    pub fn test_result_path(&self, key: &TaskKey) -> PathBuf {
        self.task_dir(key).join("test-case-result.txt")
    }

    pub fn feedback_path(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id).join("FEEDBACK.md")
    }
}
