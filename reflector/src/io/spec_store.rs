//! Behavior spec load/save.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::behavior_spec::{BehaviorSpec, parse_spec, render_spec};
use crate::io::atomic::write_atomic;

/// Load and validate the behavior spec (schema + required fields).
pub fn load_spec(path: &Path) -> Result<BehaviorSpec> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read behavior spec {}", path.display()))?;
    let spec = parse_spec(&raw).with_context(|| format!("load {}", path.display()))?;
    debug!(path = %path.display(), revision = spec.revision, "behavior spec loaded");
    Ok(spec)
}

/// Atomically write the behavior spec. Readers never observe a partial document.
pub fn write_spec(path: &Path, spec: &BehaviorSpec) -> Result<()> {
    debug!(path = %path.display(), revision = spec.revision, "writing behavior spec");
    let raw = render_spec(spec)?;
    write_atomic(path, raw.as_bytes())
}
