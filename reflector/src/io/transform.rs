//! Text transform abstraction over the external collaborator.
//!
//! The [`TextTransform`] trait decouples analysis and spec updates from the
//! collaborator backend. [`CommandTransform`] spawns the configured command;
//! tests use scripted transforms that return predetermined text.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::INSTRUCTION_PLACEHOLDER;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one collaborator invocation.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    /// Working directory for the collaborator process.
    pub workdir: PathBuf,
    /// Rendered instruction text.
    pub instruction: String,
    /// Where the collaborator is asked to write its result.
    pub output_path: PathBuf,
    /// Combined stdout/stderr log of the invocation.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// `TextTransform(input, instruction) -> output`.
pub trait TextTransform {
    /// Run the collaborator and return its text result. Empty results are errors.
    fn transform(&self, request: &TransformRequest) -> Result<String>;
}

/// Transform backed by an external command such as `microcode task "{instruction}"`.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    command: Vec<String>,
}

impl CommandTransform {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("collaborator command is empty"));
        }
        Ok(Self { command })
    }

    /// Build the process, substituting the instruction into the arguments.
    ///
    /// Returns whether the instruction was substituted; if not, it is sent on stdin.
    fn build(&self, request: &TransformRequest) -> (Command, bool) {
        let mut cmd = Command::new(&self.command[0]);
        let mut substituted = false;
        for arg in &self.command[1..] {
            if arg.contains(INSTRUCTION_PLACEHOLDER) {
                substituted = true;
                cmd.arg(arg.replace(INSTRUCTION_PLACEHOLDER, &request.instruction));
            } else {
                cmd.arg(arg);
            }
        }
        cmd.current_dir(&request.workdir);
        (cmd, substituted)
    }
}

impl TextTransform for CommandTransform {
    #[instrument(skip_all, fields(program = %self.command[0], timeout_secs = request.timeout.as_secs()))]
    fn transform(&self, request: &TransformRequest) -> Result<String> {
        info!(workdir = %request.workdir.display(), "starting collaborator");
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let (cmd, substituted) = self.build(request);
        let stdin = (!substituted).then_some(request.instruction.as_bytes());
        let output = run_command_with_timeout(
            cmd,
            stdin,
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run collaborator {}", self.command[0]))?;

        write_transform_log(request, &output)?;

        if !output.succeeded() {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "collaborator failed");
            return Err(anyhow!("collaborator {}", output.describe_failure()));
        }

        let text = if request.output_path.exists() {
            fs::read_to_string(&request.output_path).with_context(|| {
                format!("read collaborator output {}", request.output_path.display())
            })?
        } else {
            debug!("no output file written, using stdout");
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        if text.trim().is_empty() {
            return Err(anyhow!("collaborator returned an empty result"));
        }
        debug!(bytes = text.len(), "collaborator completed");
        Ok(text)
    }
}

fn write_transform_log(request: &TransformRequest, output: &CommandOutput) -> Result<()> {
    let path = &request.log_path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut buf = output.transcript();
    if output.timed_out {
        buf.push_str(&format!("\n[collaborator timed out after {:?}]\n", request.timeout));
    }
    fs::write(path, buf).with_context(|| format!("write collaborator log {}", path.display()))
}
