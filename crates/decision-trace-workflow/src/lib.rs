#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use decision_trace_domain::{ensure_non_empty, hash_bytes, hash_json, Entity, WorkflowDefinition};
use serde_json::{Map, Value};

/// A validated, normalized workflow together with its content hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedWorkflow {
    pub source_format: String,
    pub source_hash: String,
    pub workflow_hash: String,
    pub definition: WorkflowDefinition,
    pub normalized_json: Value,
    /// Step-level defects that were repaired or tolerated during normalization.
    pub warnings: Vec<String>,
}

/// Load a workflow definition from a `.json`, `.yaml` or `.yml` file.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or normalized.
pub fn load_workflow_from_path(path: &Path) -> Result<NormalizedWorkflow> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_lowercase);
    match extension.as_deref() {
        Some("yaml" | "yml") => normalize_workflow_yaml(&content),
        _ => normalize_workflow_json(&content),
    }
}

/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_workflow_yaml(yaml: &str) -> Result<NormalizedWorkflow> {
    let definition: WorkflowDefinition = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid workflow YAML structure: {err}"))?;
    finish(definition, "yaml", hash_bytes(yaml.as_bytes()))
}

/// # Errors
/// Returns an error when JSON parsing, validation, or serialization fails.
pub fn normalize_workflow_json(json: &str) -> Result<NormalizedWorkflow> {
    let definition: WorkflowDefinition = serde_json::from_str(json)
        .map_err(|err| anyhow!("invalid workflow JSON structure: {err}"))?;
    finish(definition, "json", hash_bytes(json.as_bytes()))
}

/// Normalize a definition that is already in memory.
///
/// # Errors
/// Returns an error when validation or serialization fails.
pub fn normalize_definition(definition: &WorkflowDefinition) -> Result<NormalizedWorkflow> {
    let source = serde_json::to_value(definition)?;
    let source_hash = hash_json(&source)?;
    finish(definition.clone(), "definition", source_hash)
}

fn finish(
    mut definition: WorkflowDefinition,
    source_format: &str,
    source_hash: String,
) -> Result<NormalizedWorkflow> {
    validate_workflow(&definition)?;
    let warnings = normalize_workflow(&mut definition);

    let normalized_json = serde_json::to_value(&definition)?;
    let workflow_hash = hash_json(&normalized_json)?;

    Ok(NormalizedWorkflow {
        source_format: source_format.to_string(),
        source_hash,
        workflow_hash,
        definition,
        normalized_json,
        warnings,
    })
}

/// Only workflow-level identity is fatal. Step defects degrade to documented
/// defaults in [`normalize_workflow`] so a run still records every step.
fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    ensure_non_empty("workflow_id", &workflow.workflow_id)?;
    ensure_non_empty("name", &workflow.name)?;
    Ok(())
}

fn normalize_workflow(workflow: &mut WorkflowDefinition) -> Vec<String> {
    workflow.workflow_id = workflow.workflow_id.trim().to_string();
    workflow.name = workflow.name.trim().to_string();

    let mut warnings = Vec::new();
    let mut seen = BTreeSet::new();
    for (index, step) in workflow.steps.iter_mut().enumerate() {
        let position = index + 1;
        let requested = match step.id.trim() {
            "" => format!("step_{position}"),
            id => id.to_string(),
        };
        step.id = unique_step_id(&requested, position, &seen);
        if step.id != requested {
            warnings.push(format!(
                "duplicate step id {requested} renamed to {}",
                step.id
            ));
        }
        seen.insert(step.id.clone());

        step.step_type = step.step_type.trim().to_lowercase();
        step.label = match step.label.trim() {
            "" => step.id.clone(),
            label => label.to_string(),
        };
        step.input_fields = step
            .input_fields
            .iter()
            .map(|field| field.trim().to_string())
            .filter(|field| !field.is_empty())
            .collect();

        if step.rule.is_null() {
            step.rule = Value::Object(Map::new());
        } else if !step.rule.is_object() {
            warnings.push(format!(
                "step {} rule must be a mapping, got {}; defaults apply",
                step.id, step.rule
            ));
        }
        if step.step_type == "filter" && step.input_fields.is_empty() {
            warnings.push(format!(
                "filter step {} declares no input fields; every row passes",
                step.id
            ));
        }
    }
    warnings
}

fn unique_step_id(requested: &str, position: usize, seen: &BTreeSet<String>) -> String {
    if !seen.contains(requested) {
        return requested.to_string();
    }
    let mut candidate = format!("{requested}_{position}");
    while seen.contains(&candidate) {
        candidate.push_str("_dup");
    }
    candidate
}

/// Load a dataset: a JSON array of objects, or an object holding such an
/// array under `rows` or `data`.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a list of objects.
pub fn load_dataset_from_path(path: &Path) -> Result<Vec<Entity>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}", path.display()))?;
    let document: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse dataset {}", path.display()))?;
    parse_dataset(&document)
}

/// # Errors
/// Returns an error when the document is not a list of objects.
pub fn parse_dataset(document: &Value) -> Result<Vec<Entity>> {
    let rows = match document {
        Value::Array(rows) => rows,
        Value::Object(object) => match object.get("rows").or_else(|| object.get("data")) {
            Some(Value::Array(rows)) => rows,
            _ => return Err(anyhow!("dataset object has no `rows` list")),
        },
        other => return Err(anyhow!("dataset must be a list of objects, got {other}")),
    };
    rows.iter()
        .enumerate()
        .map(|(position, row)| {
            Entity::from_json(row).with_context(|| format!("dataset row {position} is invalid"))
        })
        .collect()
}
