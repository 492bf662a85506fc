//! Reflector configuration stored at `.reflector/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::batch::DEFAULT_FAILURE_THRESHOLD;
use crate::core::marker::DEFAULT_FAILURE_SENTINEL;
use crate::io::atomic::write_atomic;

/// Placeholder replaced by the rendered instruction in `collaborator.command`.
pub const INSTRUCTION_PLACEHOLDER: &str = "{instruction}";

/// Reflector configuration (TOML).
///
/// Relative paths resolve against the workspace root. Missing fields take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReflectorConfig {
    /// Job tree written by the benchmark engine.
    pub jobs_dir: PathBuf,
    /// Where failure artifacts and per-job FEEDBACK.md are staged.
    pub staging_dir: PathBuf,
    /// Durable reflector state (processed index, loop state, reports).
    pub state_dir: PathBuf,
    /// Behavior spec document that revisions are cut from.
    pub spec_path: PathBuf,

    /// Seconds between passes in continuous mode.
    pub poll_interval_secs: u64,
    /// Failures per batch before analysis is triggered.
    pub failure_threshold: usize,
    /// Marker value that denotes a failed benchmark task.
    pub failure_sentinel: i64,

    pub collaborator: CollaboratorConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Command for the text-generation collaborator. `{instruction}` is replaced
    /// by the rendered instruction; without it the instruction goes to stdin.
    pub command: Vec<String>,
    pub analysis_timeout_secs: u64,
    pub update_timeout_secs: u64,
    /// Truncate collaborator stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "microcode".to_string(),
                "task".to_string(),
                INSTRUCTION_PLACEHOLDER.to_string(),
            ],
            analysis_timeout_secs: 1500,
            update_timeout_secs: 1500,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Where revisions are published.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Revision directories under `registry.dir`.
    #[default]
    Dir,
    /// External hub commands (`push_command` / `pull_command`).
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub dir: PathBuf,
    pub name: String,
    pub branch: String,
    /// Supporting files attached to every revision.
    pub code_paths: Vec<PathBuf>,
    pub commit_message: String,
    /// Hub upload command. `{bundle_dir}`, `{name}` and `{branch}` are
    /// substituted; it must print the revision manifest as JSON on stdout.
    pub push_command: Vec<String>,
    /// Hub download command. It writes the latest revision into `{dest_dir}`
    /// and leaves it empty when nothing was published yet.
    pub pull_command: Vec<String>,
    /// Bound on every hub command; a push that runs over is retried next pass.
    pub publish_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Dir,
            dir: PathBuf::from(".reflector/registry"),
            name: "nanocode".to_string(),
            branch: "prod".to_string(),
            code_paths: Vec::new(),
            commit_message: "run reflection".to_string(),
            push_command: Vec::new(),
            pull_command: Vec::new(),
            publish_timeout_secs: 300,
        }
    }
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("jobs"),
            staging_dir: PathBuf::from("failed-jobs"),
            state_dir: PathBuf::from(".reflector"),
            spec_path: PathBuf::from("agent/behavior_spec.toml"),
            poll_interval_secs: 10,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_sentinel: DEFAULT_FAILURE_SENTINEL,
            collaborator: CollaboratorConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ReflectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be > 0"));
        }
        if self.collaborator.analysis_timeout_secs == 0 {
            return Err(anyhow!("collaborator.analysis_timeout_secs must be > 0"));
        }
        if self.collaborator.update_timeout_secs == 0 {
            return Err(anyhow!("collaborator.update_timeout_secs must be > 0"));
        }
        if self.collaborator.output_limit_bytes == 0 {
            return Err(anyhow!("collaborator.output_limit_bytes must be > 0"));
        }
        if self.collaborator.command.is_empty() || self.collaborator.command[0].trim().is_empty()
        {
            return Err(anyhow!("collaborator.command must be a non-empty array"));
        }
        if self.registry.name.trim().is_empty() || self.registry.name.contains('/') {
            return Err(anyhow!("registry.name must be non-empty and contain no '/'"));
        }
        if self.registry.branch.trim().is_empty() || self.registry.branch.contains('/') {
            return Err(anyhow!("registry.branch must be non-empty and contain no '/'"));
        }
        if self.registry.publish_timeout_secs == 0 {
            return Err(anyhow!("registry.publish_timeout_secs must be > 0"));
        }
        if self.registry.backend == RegistryBackend::Command {
            for (field, command) in [
                ("push_command", &self.registry.push_command),
                ("pull_command", &self.registry.pull_command),
            ] {
                if command.first().is_none_or(|program| program.trim().is_empty()) {
                    return Err(anyhow!(
                        "registry.{field} must be a non-empty array for the command backend"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ReflectorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ReflectorConfig> {
    if !path.exists() {
        let cfg = ReflectorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ReflectorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ReflectorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ReflectorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = ReflectorConfig {
            failure_threshold: 3,
            ..ReflectorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "failure_threshold = 4\n\n[registry]\nbranch = \"dev\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.failure_threshold, 4);
        assert_eq!(cfg.registry.branch, "dev");
        assert_eq!(cfg.registry.name, "nanocode");
        assert_eq!(cfg.poll_interval_secs, 10);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "failure_threshold = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failure_threshold must be > 0"));
    }

    #[test]
    fn command_backend_needs_hub_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[registry]\nbackend = \"command\"\npush_command = [\"hub\", \"push\"]\n")
            .expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("registry.pull_command"), "{err:#}");

        fs::write(
            &path,
            "[registry]\nbackend = \"command\"\npush_command = [\"hub\", \"push\"]\npull_command = [\"hub\", \"pull\"]\npublish_timeout_secs = 30\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.registry.backend, RegistryBackend::Command);
        assert_eq!(cfg.registry.publish_timeout_secs, 30);
    }

    #[test]
    fn empty_command_is_rejected() {
        let cfg = ReflectorConfig {
            collaborator: CollaboratorConfig {
                command: Vec::new(),
                ..CollaboratorConfig::default()
            },
            ..ReflectorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
