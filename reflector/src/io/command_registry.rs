//! Registry backed by external hub commands.
//!
//! A push lays the revision out the same way [`DirRegistry`] stores it (spec,
//! `code/`, plus a `bundle.json` describing the upload) and runs
//! `push_command` on that directory. The command prints the manifest the hub
//! assigned. A pull runs `pull_command`, which copies the latest revision into
//! an empty directory. Every command is bounded by the publish timeout.
//!
//! [`DirRegistry`]: crate::io::registry::DirRegistry

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::write_json_atomic;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::registry::{
    MANIFEST_FILE_NAME, PulledRevision, Registry, RegistryTarget, RevisionManifest, SpecBundle,
    read_revision_dir, sha256_hex, write_bundle,
};

pub const BUNDLE_FILE_NAME: &str = "bundle.json";

/// Upload description written next to the staged files.
#[derive(Debug, Serialize)]
struct BundleMetadata<'a> {
    name: &'a str,
    branch: &'a str,
    commit_message: &'a str,
    spec_revision: u64,
    spec_sha256: String,
    files: Vec<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    push_command: Vec<String>,
    pull_command: Vec<String>,
    /// Working directory for hub commands.
    workdir: PathBuf,
    /// Parent of the per-call staging directories.
    scratch_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandRegistry {
    pub fn new(
        push_command: Vec<String>,
        pull_command: Vec<String>,
        workdir: PathBuf,
        scratch_dir: PathBuf,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        for (what, command) in [("push", &push_command), ("pull", &pull_command)] {
            if command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(anyhow!("registry {what} command is empty"));
            }
        }
        Ok(Self {
            push_command,
            pull_command,
            workdir,
            scratch_dir,
            timeout,
            output_limit_bytes,
        })
    }

    fn staging_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create {}", self.scratch_dir.display()))?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.scratch_dir)
            .with_context(|| format!("create staging directory in {}", self.scratch_dir.display()))
    }

    fn run(&self, template: &[String], vars: &[(&str, &str)]) -> Result<CommandOutput> {
        let cmd = expand(template, vars, &self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run hub command {}", template[0]))?;
        if !output.succeeded() {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "hub command failed");
            return Err(anyhow!("hub command {} {}", template[0], output.describe_failure()));
        }
        Ok(output)
    }
}

impl Registry for CommandRegistry {
    fn latest_revision(&self, target: &RegistryTarget) -> Result<Option<u64>> {
        Ok(self.pull(target)?.map(|pulled| pulled.manifest.revision))
    }

    #[instrument(skip_all, fields(name = %target.name, branch = %target.branch, timeout_secs = self.timeout.as_secs()))]
    fn push(&self, target: &RegistryTarget, bundle: &SpecBundle) -> Result<RevisionManifest> {
        let staged = self.staging_dir(".push-")?;
        write_bundle(staged.path(), bundle)?;
        let spec_sha256 = sha256_hex(bundle.spec_toml.as_bytes());
        write_json_atomic(
            &staged.path().join(BUNDLE_FILE_NAME),
            &BundleMetadata {
                name: &target.name,
                branch: &target.branch,
                commit_message: &bundle.commit_message,
                spec_revision: bundle.spec_revision,
                spec_sha256: spec_sha256.clone(),
                files: bundle.code_files.iter().map(|f| f.path.as_str()).collect(),
            },
        )?;

        let bundle_dir = staged.path().to_string_lossy().into_owned();
        let output = self.run(
            &self.push_command,
            &[
                ("{bundle_dir}", &bundle_dir),
                ("{name}", &target.name),
                ("{branch}", &target.branch),
            ],
        )?;
        let manifest = parse_manifest(&output.stdout)?;
        if manifest.spec_sha256 != spec_sha256 {
            return Err(anyhow!(
                "hub stored spec digest {}, uploaded {spec_sha256}",
                manifest.spec_sha256
            ));
        }
        if manifest.name != target.name || manifest.branch != target.branch {
            return Err(anyhow!(
                "hub published to {}/{}, requested {}/{}",
                manifest.name,
                manifest.branch,
                target.name,
                target.branch
            ));
        }
        info!(revision = manifest.revision, spec_revision = bundle.spec_revision, "revision pushed to hub");
        Ok(manifest)
    }

    #[instrument(skip_all, fields(name = %target.name, branch = %target.branch))]
    fn pull(&self, target: &RegistryTarget) -> Result<Option<PulledRevision>> {
        let dest = self.staging_dir(".pull-")?;
        let dest_dir = dest.path().to_string_lossy().into_owned();
        self.run(
            &self.pull_command,
            &[
                ("{dest_dir}", &dest_dir),
                ("{name}", &target.name),
                ("{branch}", &target.branch),
            ],
        )?;
        if !dest.path().join(MANIFEST_FILE_NAME).exists() {
            debug!("hub has no revision yet");
            return Ok(None);
        }
        read_revision_dir(dest.path()).map(Some)
    }
}

/// Substitute `vars` into every argument of `template`.
fn expand(template: &[String], vars: &[(&str, &str)], workdir: &Path) -> Command {
    let substitute = |arg: &str| {
        vars.iter()
            .fold(arg.to_string(), |acc, (key, value)| acc.replace(key, value))
    };
    let mut cmd = Command::new(substitute(&template[0]));
    for arg in &template[1..] {
        cmd.arg(substitute(arg));
    }
    cmd.current_dir(workdir);
    cmd
}

/// The manifest is the last non-empty stdout line; earlier lines are progress output.
fn parse_manifest(stdout: &[u8]) -> Result<RevisionManifest> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| anyhow!("hub push printed no manifest"))?;
    serde_json::from_str(line.trim()).context("parse manifest printed by hub push")
}
