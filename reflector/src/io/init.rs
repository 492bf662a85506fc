//! Workspace paths and `reflector init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::behavior_spec::default_spec;
use crate::io::config::{ReflectorConfig, write_config};
use crate::io::spec_store::write_spec;

/// Default config location relative to the workspace root.
pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(".reflector").join("config.toml")
}

/// All canonical paths for a workspace, resolved against its root.
#[derive(Debug, Clone)]
pub struct ReflectorPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub jobs_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub state_dir: PathBuf,
    pub spec_path: PathBuf,
    pub registry_dir: PathBuf,
    pub processed_log_path: PathBuf,
    pub processed_lock_path: PathBuf,
    pub loop_state_path: PathBuf,
    pub feedback_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl ReflectorPaths {
    pub fn resolve(root: impl Into<PathBuf>, config_path: PathBuf, cfg: &ReflectorConfig) -> Self {
        let root = root.into();
        let state_dir = root.join(&cfg.state_dir);
        Self {
            config_path,
            jobs_dir: root.join(&cfg.jobs_dir),
            staging_dir: root.join(&cfg.staging_dir),
            spec_path: root.join(&cfg.spec_path),
            registry_dir: root.join(&cfg.registry.dir),
            processed_log_path: state_dir.join("processed.jsonl"),
            processed_lock_path: state_dir.join("processed.lock"),
            loop_state_path: state_dir.join("loop_state.json"),
            feedback_dir: state_dir.join("feedback"),
            work_dir: state_dir.join("work"),
            state_dir,
            root,
        }
    }
}

/// Options for `init_reflector`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config and seed spec.
    pub force: bool,
}

/// Create the config, state directories and a seed behavior spec.
///
/// Fails if the config already exists unless `options.force` is set. An
/// existing spec is only replaced with `force`.
pub fn init_reflector(
    paths: &ReflectorPaths,
    cfg: &ReflectorConfig,
    options: &InitOptions,
) -> Result<()> {
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "reflector init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [
        &paths.state_dir,
        &paths.feedback_dir,
        &paths.work_dir,
        &paths.staging_dir,
        &paths.registry_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_config(&paths.config_path, cfg)?;
    if options.force || !paths.spec_path.exists() {
        write_spec(&paths.spec_path, &default_spec())?;
    }
    Ok(())
}
