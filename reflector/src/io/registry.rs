//! Revision registry: versioned, immutable snapshots of the behavior spec plus
//! the code files shipped with it.
//!
//! The registry assigns revision numbers. [`DirRegistry`] stores revisions on
//! disk under `<dir>/<name>/<branch>/revisions/<N>/`; a revision directory
//! appears with a single rename, so readers never observe a partial revision.
//! [`CommandRegistry`] hands the same directory layout to external hub
//! commands.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::write_json_atomic;
use crate::io::command_registry::CommandRegistry;
use crate::io::config::{ReflectorConfig, RegistryBackend};
use crate::io::init::ReflectorPaths;

pub const SPEC_FILE_NAME: &str = "behavior_spec.toml";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
const CODE_DIR_NAME: &str = "code";
const REVISIONS_DIR_NAME: &str = "revisions";
/// Attempts to claim a revision number when other publishers race us.
const MAX_CLAIM_ATTEMPTS: u32 = 5;

/// Repository name and branch a revision is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTarget {
    pub name: String,
    pub branch: String,
}

/// A file shipped alongside the spec, keyed by its workspace-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFile {
    pub path: String,
    pub contents: Vec<u8>,
}

/// Everything a push stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecBundle {
    pub spec_toml: String,
    pub spec_revision: u64,
    pub code_files: Vec<CodeFile>,
    pub commit_message: String,
}

/// Metadata stored with every revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionManifest {
    pub revision: u64,
    pub name: String,
    pub branch: String,
    pub commit_message: String,
    pub spec_revision: u64,
    pub spec_sha256: String,
    /// Code file paths, relative to the revision's `code/` directory.
    pub files: Vec<String>,
    pub published_at: DateTime<Utc>,
}

/// Latest revision as read back from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledRevision {
    pub manifest: RevisionManifest,
    pub spec_toml: String,
    pub code_files: Vec<CodeFile>,
}

/// Storage backend for published revisions.
pub trait Registry {
    /// Highest revision on `target`, or `None` if nothing was published yet.
    fn latest_revision(&self, target: &RegistryTarget) -> Result<Option<u64>>;

    /// Store `bundle` as a new revision. Either the whole revision becomes
    /// visible or nothing changes.
    fn push(&self, target: &RegistryTarget, bundle: &SpecBundle) -> Result<RevisionManifest>;

    /// Read the latest revision.
    fn pull(&self, target: &RegistryTarget) -> Result<Option<PulledRevision>>;
}

/// Hex sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Build a manifest for `bundle` at `revision`.
pub fn manifest_for(
    target: &RegistryTarget,
    bundle: &SpecBundle,
    revision: u64,
    published_at: DateTime<Utc>,
) -> RevisionManifest {
    RevisionManifest {
        revision,
        name: target.name.clone(),
        branch: target.branch.clone(),
        commit_message: bundle.commit_message.clone(),
        spec_revision: bundle.spec_revision,
        spec_sha256: sha256_hex(bundle.spec_toml.as_bytes()),
        files: bundle.code_files.iter().map(|file| file.path.clone()).collect(),
        published_at,
    }
}

/// Filesystem registry rooted at `dir`.
#[derive(Debug, Clone)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn branch_dir(&self, target: &RegistryTarget) -> PathBuf {
        self.root.join(&target.name).join(&target.branch)
    }

    fn revisions_dir(&self, target: &RegistryTarget) -> PathBuf {
        self.branch_dir(target).join(REVISIONS_DIR_NAME)
    }
}

impl Registry for DirRegistry {
    fn latest_revision(&self, target: &RegistryTarget) -> Result<Option<u64>> {
        let dir = self.revisions_dir(target);
        if !dir.exists() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                latest = latest.max(Some(n));
            }
        }
        Ok(latest)
    }

    #[instrument(skip_all, fields(name = %target.name, branch = %target.branch))]
    fn push(&self, target: &RegistryTarget, bundle: &SpecBundle) -> Result<RevisionManifest> {
        let revisions = self.revisions_dir(target);
        fs::create_dir_all(&revisions)
            .with_context(|| format!("create {}", revisions.display()))?;

        // Dropping the TempDir on any early return removes the partial revision.
        let staged = tempfile::Builder::new()
            .prefix(".push-")
            .tempdir_in(self.branch_dir(target))
            .context("create push staging directory")?;
        write_bundle(staged.path(), bundle)?;

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let revision = self.latest_revision(target)?.map_or(1, |n| n + 1);
            let manifest = manifest_for(target, bundle, revision, Utc::now());
            write_json_atomic(&staged.path().join(MANIFEST_FILE_NAME), &manifest)?;

            let dest = revisions.join(revision.to_string());
            if dest.exists() {
                warn!(revision, attempt, "revision already claimed, retrying");
                continue;
            }
            match fs::rename(staged.path(), &dest) {
                Ok(()) => {
                    // Nothing is left at the staging path for `staged` to clean up.
                    info!(revision, spec_revision = bundle.spec_revision, "revision published");
                    return Ok(manifest);
                }
                Err(err) if dest.exists() => {
                    warn!(revision, attempt, err = %err, "lost race for revision, retrying");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("publish {}", dest.display()));
                }
            }
        }
        Err(anyhow!(
            "could not claim a revision number after {MAX_CLAIM_ATTEMPTS} attempts"
        ))
    }

    fn pull(&self, target: &RegistryTarget) -> Result<Option<PulledRevision>> {
        let Some(revision) = self.latest_revision(target)? else {
            return Ok(None);
        };
        let dir = self.revisions_dir(target).join(revision.to_string());
        let pulled = read_revision_dir(&dir)?;
        debug!(revision, files = pulled.code_files.len(), "revision pulled");
        Ok(Some(pulled))
    }
}

impl<R: Registry + ?Sized> Registry for Box<R> {
    fn latest_revision(&self, target: &RegistryTarget) -> Result<Option<u64>> {
        (**self).latest_revision(target)
    }

    fn push(&self, target: &RegistryTarget, bundle: &SpecBundle) -> Result<RevisionManifest> {
        (**self).push(target, bundle)
    }

    fn pull(&self, target: &RegistryTarget) -> Result<Option<PulledRevision>> {
        (**self).pull(target)
    }
}

/// Build the registry the config selects.
pub fn open_registry(paths: &ReflectorPaths, config: &ReflectorConfig) -> Result<Box<dyn Registry>> {
    Ok(match config.registry.backend {
        RegistryBackend::Dir => Box::new(DirRegistry::new(paths.registry_dir.clone())),
        RegistryBackend::Command => Box::new(CommandRegistry::new(
            config.registry.push_command.clone(),
            config.registry.pull_command.clone(),
            paths.root.clone(),
            paths.work_dir.clone(),
            Duration::from_secs(config.registry.publish_timeout_secs),
            config.collaborator.output_limit_bytes,
        )?),
    })
}

/// Lay out a revision directory: the spec, plus code files under `code/`.
/// The manifest is written separately once the revision number is known.
pub(crate) fn write_bundle(dir: &Path, bundle: &SpecBundle) -> Result<()> {
    fs::write(dir.join(SPEC_FILE_NAME), &bundle.spec_toml).context("stage behavior spec")?;
    for file in &bundle.code_files {
        let dest = dir.join(CODE_DIR_NAME).join(checked_relative(&file.path)?);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&dest, &file.contents)
            .with_context(|| format!("stage code file {}", file.path))?;
    }
    Ok(())
}

/// Read a revision directory back, checking the spec digest against the manifest.
pub(crate) fn read_revision_dir(dir: &Path) -> Result<PulledRevision> {
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let manifest: RevisionManifest = serde_json::from_str(
        &fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()))?,
    )
    .with_context(|| format!("parse {}", manifest_path.display()))?;

    let spec_path = dir.join(SPEC_FILE_NAME);
    let spec_toml =
        fs::read_to_string(&spec_path).with_context(|| format!("read {}", spec_path.display()))?;
    let digest = sha256_hex(spec_toml.as_bytes());
    if digest != manifest.spec_sha256 {
        return Err(anyhow!(
            "revision {} spec digest mismatch: manifest {}, stored {digest}",
            manifest.revision,
            manifest.spec_sha256
        ));
    }

    let mut code_files = Vec::with_capacity(manifest.files.len());
    for path in &manifest.files {
        let file = dir.join(CODE_DIR_NAME).join(checked_relative(path)?);
        let contents = fs::read(&file).with_context(|| format!("read {}", file.display()))?;
        code_files.push(CodeFile {
            path: path.clone(),
            contents,
        });
    }
    Ok(PulledRevision {
        manifest,
        spec_toml,
        code_files,
    })
}

/// Reject absolute paths and `..` so code files stay inside the revision.
fn checked_relative(path: &str) -> Result<&Path> {
    let candidate = Path::new(path);
    let ok = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !ok {
        return Err(anyhow!("code file path must be relative and inside the workspace: {path}"));
    }
    Ok(candidate)
}
