//! Revision publisher: pushes accepted specs and guards revision monotonicity.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::behavior_spec::{BehaviorSpec, render_spec};
use crate::core::types::HubRevision;
use crate::error::ReflectError;
use crate::io::registry::{
    CodeFile, Registry, RegistryTarget, RevisionManifest, SpecBundle, sha256_hex,
};

pub struct Publisher<'a, R: Registry> {
    registry: &'a R,
    target: RegistryTarget,
    /// Workspace root that `code_paths` are relative to.
    root: PathBuf,
    code_paths: Vec<PathBuf>,
    commit_message: String,
    last_observed: u64,
}

impl<'a, R: Registry> Publisher<'a, R> {
    /// Connect to `registry` and record its current latest revision.
    ///
    /// `last_known` is the revision persisted by a previous run; a mismatch is
    /// logged, and the registry's value wins.
    pub fn connect(
        registry: &'a R,
        target: RegistryTarget,
        root: PathBuf,
        code_paths: Vec<PathBuf>,
        commit_message: String,
        last_known: u64,
    ) -> Result<Self> {
        let last_observed = registry
            .latest_revision(&target)
            .with_context(|| format!("query registry {}/{}", target.name, target.branch))?
            .unwrap_or(0);
        if last_observed != last_known {
            warn!(
                last_known,
                last_observed, "registry revision moved while we were stopped"
            );
        }
        Ok(Self {
            registry,
            target,
            root,
            code_paths,
            commit_message,
            last_observed,
        })
    }

    pub fn last_observed(&self) -> u64 {
        self.last_observed
    }

    /// Publish `spec` with the configured code files.
    ///
    /// Push failures are [`ReflectError::PublishFailed`] (retryable). A
    /// revision other than `last_observed + 1` is [`ReflectError::RevisionConflict`].
    #[instrument(skip_all, fields(name = %self.target.name, branch = %self.target.branch, spec_revision = spec.revision))]
    pub fn publish(&mut self, spec: &BehaviorSpec) -> Result<HubRevision> {
        let bundle = self.bundle(spec).map_err(|err| publish_failed(&err))?;
        let manifest = self
            .registry
            .push(&self.target, &bundle)
            .map_err(|err| publish_failed(&err))?;

        let expected = self.last_observed + 1;
        if manifest.revision != expected {
            return Err(ReflectError::RevisionConflict {
                returned: manifest.revision,
                expected,
            }
            .into());
        }
        self.last_observed = manifest.revision;
        info!(revision = manifest.revision, "behavior spec published");
        Ok(hub_revision(manifest))
    }

    /// Finish a publish that may already have landed before a crash.
    ///
    /// If the registry's latest revision carries exactly `spec` (same spec
    /// revision and digest), that revision is adopted instead of pushing a
    /// duplicate. Otherwise this is [`Publisher::publish`].
    #[instrument(skip_all, fields(name = %self.target.name, branch = %self.target.branch, spec_revision = spec.revision))]
    pub fn resume(&mut self, spec: &BehaviorSpec) -> Result<HubRevision> {
        let digest = sha256_hex(render_spec(spec).map_err(|err| publish_failed(&err))?.as_bytes());
        let latest = self
            .registry
            .pull(&self.target)
            .map_err(|err| publish_failed(&err))?;
        if let Some(pulled) = latest {
            let manifest = pulled.manifest;
            if manifest.spec_revision == spec.revision && manifest.spec_sha256 == digest {
                info!(revision = manifest.revision, "deferred publish already landed, adopting it");
                self.last_observed = self.last_observed.max(manifest.revision);
                return Ok(hub_revision(manifest));
            }
        }
        self.publish(spec)
    }

    fn bundle(&self, spec: &BehaviorSpec) -> Result<SpecBundle> {
        let mut code_files = Vec::new();
        for path in &self.code_paths {
            collect_files(&self.root, &self.root.join(path), &mut code_files)?;
        }
        Ok(SpecBundle {
            spec_toml: render_spec(spec)?,
            spec_revision: spec.revision,
            code_files,
            commit_message: self.commit_message.clone(),
        })
    }
}

fn hub_revision(manifest: RevisionManifest) -> HubRevision {
    HubRevision {
        name: manifest.name,
        branch: manifest.branch,
        revision: manifest.revision,
        spec_revision: manifest.spec_revision,
        spec_sha256: manifest.spec_sha256,
        published_at: manifest.published_at,
    }
}

fn publish_failed(err: &anyhow::Error) -> anyhow::Error {
    let reason = format!("{err:#}");
    warn!(reason = %reason, "publish failed, will retry");
    ReflectError::PublishFailed { reason }.into()
}

/// Read `path` (a file or a directory tree) into `out`, keyed relative to `root`.
///
/// Symlinked files are read through; symlinked directories are skipped.
fn collect_files(root: &Path, path: &Path, out: &mut Vec<CodeFile>) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("stat code path {}", path.display()))?;
    if meta.file_type().is_symlink() {
        let target = fs::metadata(path)
            .with_context(|| format!("follow code path link {}", path.display()))?;
        if target.is_dir() {
            warn!(path = %path.display(), "skipping symlinked directory in code paths");
            return Ok(());
        }
    } else if meta.is_dir() {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("read {}", path.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("read entries of {}", path.display()))?;
        entries.sort();
        for entry in entries {
            collect_files(root, &entry, out)?;
        }
        return Ok(());
    }
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("code path {} is outside {}", path.display(), root.display()))?;
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let contents = fs::read(path).with_context(|| format!("read code file {}", path.display()))?;
    out.push(CodeFile {
        path: key,
        contents,
    });
    Ok(())
}
