//! Test-only fixtures: job trees on disk, a scripted collaborator and an
//! in-memory registry.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Utc;

use crate::core::locator::{ArtifactLocator, ArtifactPaths};
use crate::core::types::TaskKey;
use crate::io::config::ReflectorConfig;
use crate::io::init::{InitOptions, ReflectorPaths, default_config_path, init_reflector};
use crate::io::registry::{
    PulledRevision, Registry, RegistryTarget, RevisionManifest, SpecBundle, manifest_for,
};
use crate::io::transform::{TextTransform, TransformRequest};

/// Initialize a workspace under `root` with default config and the given threshold.
pub fn seed_workspace(root: &Path, failure_threshold: usize) -> (ReflectorPaths, ReflectorConfig) {
    let config = ReflectorConfig {
        failure_threshold,
        ..ReflectorConfig::default()
    };
    let paths = ReflectorPaths::resolve(root, default_config_path(root), &config);
    init_reflector(&paths, &config, &InitOptions { force: false }).expect("init workspace");
    (paths, config)
}

/// Builds `jobs/<job>/<task>/` layouts the way the benchmark engine writes them.
#[derive(Debug, Clone)]
pub struct JobTreeFixture {
    locator: ArtifactLocator,
}

impl JobTreeFixture {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            locator: ArtifactLocator::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.locator.jobs_root()
    }

    pub fn task(&self, job_id: &str, task_id: &str) -> TaskFixture {
        TaskFixture {
            paths: self.locator.locate(&TaskKey::new(job_id, task_id)),
            marker: None,
            trajectory: None,
            test_output: None,
        }
    }
}

/// One task directory; nothing is written until [`TaskFixture::build`].
#[derive(Debug, Clone)]
pub struct TaskFixture {
    paths: ArtifactPaths,
    marker: Option<String>,
    trajectory: Option<String>,
    test_output: Option<String>,
}

impl TaskFixture {
    pub fn marker(mut self, contents: &str) -> Self {
        self.marker = Some(contents.to_string());
        self
    }

    pub fn trajectory(mut self, contents: &str) -> Self {
        self.trajectory = Some(contents.to_string());
        self
    }

    pub fn test_output(mut self, contents: &str) -> Self {
        self.test_output = Some(contents.to_string());
        self
    }

    pub fn build(self) -> ArtifactPaths {
        fs::create_dir_all(&self.paths.task_dir).expect("create task dir");
        for (path, contents) in [
            (&self.paths.completion_marker, &self.marker),
            (&self.paths.primary_log, &self.trajectory),
            (&self.paths.secondary_log, &self.test_output),
        ] {
            if let Some(contents) = contents {
                fs::create_dir_all(path.parent().expect("artifact parent")).expect("mkdir");
                fs::write(path, contents).expect("write artifact");
            }
        }
        self.paths
    }
}

/// Scripted collaborator response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Write the text to the request's output path and return it.
    Reply(String),
    /// Fail with this message.
    Fail(String),
}

/// Deterministic [`TextTransform`] that replays queued steps and records requests.
#[derive(Debug, Default)]
pub struct ScriptedTransform {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: Mutex<Vec<TransformRequest>>,
}

impl ScriptedTransform {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: ScriptedStep) {
        lock(&self.steps).push_back(step);
    }

    pub fn calls(&self) -> Vec<TransformRequest> {
        lock(&self.calls).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.steps).len()
    }
}

impl TextTransform for ScriptedTransform {
    fn transform(&self, request: &TransformRequest) -> Result<String> {
        lock(&self.calls).push(request.clone());
        let step = lock(&self.steps)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted transform has no step left"))?;
        match step {
            ScriptedStep::Reply(text) => {
                if let Some(parent) = request.output_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&request.output_path, &text)?;
                Ok(text)
            }
            ScriptedStep::Fail(message) => Err(anyhow!(message)),
        }
    }
}

type BranchKey = (String, String);

/// In-memory [`Registry`] with failure and concurrent-publisher injection.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    branches: Mutex<HashMap<BranchKey, Vec<(RevisionManifest, SpecBundle)>>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next push fail with `reason`.
    pub fn fail_next_push(&self, reason: &str) {
        *lock(&self.fail_next) = Some(reason.to_string());
    }

    /// Publish a revision as if another publisher did it. Returns its number.
    pub fn inject_foreign_push(&self, target: &RegistryTarget) -> u64 {
        let bundle = SpecBundle {
            spec_toml: "foreign = true\n".to_string(),
            spec_revision: 0,
            code_files: Vec::new(),
            commit_message: "foreign publisher".to_string(),
        };
        self.store(target, bundle).revision
    }

    pub fn revisions(&self, target: &RegistryTarget) -> Vec<RevisionManifest> {
        lock(&self.branches)
            .get(&branch_key(target))
            .map(|revisions| revisions.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default()
    }

    fn store(&self, target: &RegistryTarget, bundle: SpecBundle) -> RevisionManifest {
        let mut branches = lock(&self.branches);
        let revisions = branches.entry(branch_key(target)).or_default();
        let manifest = manifest_for(target, &bundle, revisions.len() as u64 + 1, Utc::now());
        revisions.push((manifest.clone(), bundle));
        manifest
    }
}

impl Registry for MemoryRegistry {
    fn latest_revision(&self, target: &RegistryTarget) -> Result<Option<u64>> {
        Ok(lock(&self.branches)
            .get(&branch_key(target))
            .and_then(|revisions| revisions.last())
            .map(|(manifest, _)| manifest.revision))
    }

    fn push(&self, target: &RegistryTarget, bundle: &SpecBundle) -> Result<RevisionManifest> {
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(anyhow!(reason));
        }
        Ok(self.store(target, bundle.clone()))
    }

    fn pull(&self, target: &RegistryTarget) -> Result<Option<PulledRevision>> {
        Ok(lock(&self.branches)
            .get(&branch_key(target))
            .and_then(|revisions| revisions.last())
            .map(|(manifest, bundle)| PulledRevision {
                manifest: manifest.clone(),
                spec_toml: bundle.spec_toml.clone(),
                code_files: bundle.code_files.clone(),
            }))
    }
}

fn branch_key(target: &RegistryTarget) -> BranchKey {
    (target.name.clone(), target.branch.clone())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
