//! Collaborator instructions rendered from embedded templates.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::batch::FailureBatch;
use crate::core::behavior_spec::BehaviorSpec;
use crate::core::locator::StagingLayout;

const ANALYSIS_TEMPLATE: &str = include_str!("prompts/analysis.md");
const UPDATE_SPEC_TEMPLATE: &str = include_str!("prompts/update_spec.md");

#[derive(Debug, Clone, Serialize)]
struct StagedTaskContext {
    job_id: String,
    task_id: String,
    trajectory: String,
    test_result: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct FieldContext {
    name: String,
    kind: &'static str,
}

/// Inputs for the spec update instruction.
#[derive(Debug, Clone)]
pub struct UpdatePromptInputs<'a> {
    pub spec: &'a BehaviorSpec,
    /// Work copy the collaborator edits in place.
    pub spec_path: &'a Path,
    pub feedback_path: &'a Path,
    pub batch_seq: u64,
}

fn engine() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("analysis", ANALYSIS_TEMPLATE)
        .context("load analysis template")?;
    env.add_template("update_spec", UPDATE_SPEC_TEMPLATE)
        .context("load update_spec template")?;
    Ok(env)
}

/// Instruction asking the collaborator to analyze a staged batch.
pub fn render_analysis_prompt(
    batch: &FailureBatch,
    staging: &StagingLayout,
    output_path: &Path,
) -> Result<String> {
    let tasks: Vec<StagedTaskContext> = batch
        .entries
        .iter()
        .map(|entry| {
            let test_result = staging.test_result_path(&entry.key);
            StagedTaskContext {
                job_id: entry.key.job_id.clone(),
                task_id: entry.key.task_id.clone(),
                trajectory: display(staging.trajectory_path(&entry.key)),
                test_result: test_result.exists().then(|| display(test_result)),
            }
        })
        .collect();

    let env = engine()?;
    let rendered = env.get_template("analysis")?.render(context! {
        batch_seq => batch.seq,
        job_ids => batch.job_ids(),
        staging_dir => display(staging.root().to_path_buf()),
        tasks => tasks,
        output_path => display(output_path.to_path_buf()),
    })?;
    debug!(batch_seq = batch.seq, bytes = rendered.len(), "analysis prompt rendered");
    Ok(rendered)
}

/// Instruction asking the collaborator to revise the spec work copy.
pub fn render_update_prompt(inputs: &UpdatePromptInputs<'_>) -> Result<String> {
    let fields: Vec<FieldContext> = inputs
        .spec
        .fields
        .iter()
        .map(|field| FieldContext {
            name: field.name.clone(),
            kind: field.kind.as_str(),
        })
        .collect();

    let env = engine()?;
    let rendered = env.get_template("update_spec")?.render(context! {
        spec_path => display(inputs.spec_path.to_path_buf()),
        feedback_path => display(inputs.feedback_path.to_path_buf()),
        revision => inputs.spec.revision,
        batch_seq => inputs.batch_seq,
        name => inputs.spec.name.as_str(),
        fields => fields,
    })?;
    debug!(batch_seq = inputs.batch_seq, bytes = rendered.len(), "update prompt rendered");
    Ok(rendered)
}

fn display(path: PathBuf) -> String {
    path.display().to_string()
}
