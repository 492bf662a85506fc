//! Behavior spec document model and validation.
//!
//! The behavior spec is the agent's signature: top-level instructions plus
//! named input/output fields with descriptions. Its source representation is
//! TOML. Only instructions and descriptions may change between revisions; the
//! name and the field set are fixed.

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const SPEC_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/behavior_spec.schema.json"
));

/// Fields every revision must declare.
pub const REQUIRED_FIELDS: [(&str, FieldKind); 2] =
    [("task", FieldKind::Input), ("answer", FieldKind::Output)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Input,
    Output,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Input => "input",
            FieldKind::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecField {
    pub name: String,
    pub kind: FieldKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorSpec {
    /// Document revision, incremented by every accepted update.
    pub revision: u64,
    pub name: String,
    pub instructions: String,
    pub fields: Vec<SpecField>,
}

impl BehaviorSpec {
    pub fn field(&self, name: &str) -> Option<&SpecField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// True if the editable content (instructions, descriptions) is identical.
    pub fn same_content(&self, other: &BehaviorSpec) -> bool {
        self.name == other.name
            && self.instructions == other.instructions
            && self.fields == other.fields
    }
}

/// Parse TOML source into a spec: schema conformance + semantic checks.
pub fn parse_spec(raw: &str) -> Result<BehaviorSpec> {
    let table: toml::Table = toml::from_str(raw).context("parse behavior spec toml")?;
    let value = serde_json::to_value(&table).context("convert behavior spec to json")?;
    validate_schema(&value)?;
    let spec: BehaviorSpec =
        serde_json::from_value(value).context("deserialize behavior spec")?;
    let errors = validate_spec(&spec);
    if !errors.is_empty() {
        return Err(anyhow!("behavior spec invalid: {}", errors.join("; ")));
    }
    Ok(spec)
}

/// Render a spec as TOML with a trailing newline.
pub fn render_spec(spec: &BehaviorSpec) -> Result<String> {
    let mut buf = toml::to_string_pretty(spec).context("serialize behavior spec")?;
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    Ok(buf)
}

/// Semantic checks not expressible in the schema:
/// - non-empty instructions
/// - unique field names
/// - required fields present with the expected kind and a non-empty description
pub fn validate_spec(spec: &BehaviorSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if spec.instructions.trim().is_empty() {
        errors.push("instructions must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for field in &spec.fields {
        if !seen.insert(field.name.as_str()) {
            errors.push(format!("duplicate field '{}'", field.name));
        }
    }

    for (name, kind) in REQUIRED_FIELDS {
        match spec.field(name) {
            None => errors.push(format!("missing required field '{name}'")),
            Some(field) => {
                if field.kind != kind {
                    errors.push(format!(
                        "field '{name}' must be {} (got {})",
                        kind.as_str(),
                        field.kind.as_str()
                    ));
                }
                if field.description.trim().is_empty() {
                    errors.push(format!("field '{name}' has an empty description"));
                }
            }
        }
    }

    errors
}

/// Check that an update only touched editable content.
///
/// Returns stable error messages for a renamed spec or an added, removed or
/// re-kinded field.
pub fn check_shape_preserved(prev: &BehaviorSpec, next: &BehaviorSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if prev.name != next.name {
        errors.push(format!(
            "spec renamed from '{}' to '{}'",
            prev.name, next.name
        ));
    }

    let shape = |spec: &BehaviorSpec| -> Vec<(String, FieldKind)> {
        let mut fields: Vec<(String, FieldKind)> = spec
            .fields
            .iter()
            .map(|field| (field.name.clone(), field.kind))
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        fields
    };
    let prev_shape = shape(prev);
    let next_shape = shape(next);
    for (name, kind) in &prev_shape {
        match next_shape.iter().find(|(n, _)| n == name) {
            None => errors.push(format!("field '{name}' was removed")),
            Some((_, next_kind)) if next_kind != kind => errors.push(format!(
                "field '{name}' changed kind from {} to {}",
                kind.as_str(),
                next_kind.as_str()
            )),
            Some(_) => {}
        }
    }
    for (name, _) in &next_shape {
        if !prev_shape.iter().any(|(n, _)| n == name) {
            errors.push(format!("field '{name}' was added"));
        }
    }
    errors
}

/// Seed spec written by `reflector init`.
pub fn default_spec() -> BehaviorSpec {
    BehaviorSpec {
        revision: 1,
        name: "CodingAssistant".to_string(),
        instructions: DEFAULT_INSTRUCTIONS.to_string(),
        fields: vec![
            SpecField {
                name: "task".to_string(),
                kind: FieldKind::Input,
                description: "The user's coding task or question".to_string(),
            },
            SpecField {
                name: "answer".to_string(),
                kind: FieldKind::Output,
                description: "Your response to the user after completing the task".to_string(),
            },
        ],
    }
}

const DEFAULT_INSTRUCTIONS: &str = "You are a concise coding assistant.

Two execution environments exist. Code you write runs in an isolated sandbox \
whose variables persist between iterations; use it for data processing and \
string manipulation. Tool functions (read_file, write_file, edit_file, \
run_bash, glob_files, grep_files) run on the real host and have persistent \
side effects; use them for files, shell commands and code search.

A variable holding file contents does not change when the file changes. Read \
the file again after editing it.";

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(SPEC_SCHEMA).context("parse embedded spec schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "behavior spec schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
