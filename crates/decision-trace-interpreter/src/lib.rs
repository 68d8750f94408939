#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use decision_trace_domain::{
    AppliedRule, Check, Entity, Evaluation, Execution, RankingOutcome, Scalar, StepKind, StepSpec,
    WorkflowDefinition,
};
use decision_trace_reasoning::{filter_reasoning, ranking_reasoning};
use decision_trace_rules::{apply_filters, rank_with_rules, FilterOutcome, RuleSet, RuleSourceKind};
use decision_trace_trace_core::{RecorderConfig, StepDraft, TraceRecorder, TraceStore};
use decision_trace_workflow::{normalize_definition, NormalizedWorkflow};
use serde_json::{json, Value};
use tracing::warn;

/// Outcome of a workflow filter condition whose operator is not recognized.
/// Workflow conditions fail closed, unlike filter rules from a rule source.
pub const UNKNOWN_OPERATOR_PASSES: bool = false;

const WORKFLOW_RULE_SOURCE: &str = "workflow_definition";

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub execution_name: Option<String>,
    pub auto_persist: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            execution_name: None,
            auto_persist: true,
        }
    }
}

/// Datasets and workflow definitions known to a host, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceRepository {
    datasets: BTreeMap<String, Vec<Entity>>,
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkspaceRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset, returning the rows it replaced.
    pub fn register_dataset(
        &mut self,
        dataset_id: impl Into<String>,
        rows: Vec<Entity>,
    ) -> Option<Vec<Entity>> {
        self.datasets.insert(dataset_id.into(), rows)
    }

    #[must_use]
    pub fn dataset(&self, dataset_id: &str) -> Option<&[Entity]> {
        self.datasets.get(dataset_id).map(Vec::as_slice)
    }

    pub fn remove_dataset(&mut self, dataset_id: &str) -> Option<Vec<Entity>> {
        self.datasets.remove(dataset_id)
    }

    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Register a workflow under its own `workflow_id`.
    pub fn register_workflow(&mut self, workflow: WorkflowDefinition) -> Option<WorkflowDefinition> {
        self.workflows.insert(workflow.workflow_id.clone(), workflow)
    }

    #[must_use]
    pub fn workflow(&self, workflow_id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(workflow_id)
    }

    pub fn remove_workflow(&mut self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.remove(workflow_id)
    }

    pub fn workflow_ids(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub execution: Execution,
    /// Rows that survived every step, in final order.
    pub rows: Vec<Entity>,
}

/// A dataset row together with its position in the original dataset, which
/// keeps positional ids stable across steps.
#[derive(Debug, Clone)]
struct Row {
    position: usize,
    entity: Entity,
}

struct StepResult {
    kind: StepKind,
    rows: Vec<Row>,
    evaluations: Vec<Evaluation>,
    output: Value,
    reasoning: String,
}

pub struct WorkflowInterpreter<'s> {
    store: Option<&'s dyn TraceStore>,
    config: InterpreterConfig,
}

impl<'s> WorkflowInterpreter<'s> {
    #[must_use]
    pub fn new(store: Option<&'s dyn TraceStore>, config: InterpreterConfig) -> Self {
        Self { store, config }
    }

    /// Run a registered workflow over a registered dataset.
    ///
    /// # Errors
    /// Returns an error when either id is unknown or execution fails.
    pub fn execute_from(
        &self,
        repository: &WorkspaceRepository,
        workflow_id: &str,
        dataset_id: &str,
    ) -> Result<WorkflowRun> {
        let workflow = repository
            .workflow(workflow_id)
            .ok_or_else(|| anyhow!("unknown workflow: {workflow_id}"))?;
        let dataset = repository
            .dataset(dataset_id)
            .ok_or_else(|| anyhow!("unknown dataset: {dataset_id}"))?;
        self.execute(workflow, dataset)
    }

    /// Thread `dataset` through every step of `workflow` in order, recording
    /// one trace step per workflow step.
    ///
    /// # Errors
    /// Returns an error when the workflow is invalid or the trace cannot be
    /// persisted.
    pub fn execute(&self, workflow: &WorkflowDefinition, dataset: &[Entity]) -> Result<WorkflowRun> {
        let normalized = normalize_definition(workflow)?;
        let name = self
            .config
            .execution_name
            .clone()
            .unwrap_or_else(|| normalized.definition.name.clone());
        let recorder_config = RecorderConfig {
            auto_persist: self.config.auto_persist,
        };

        let (rows, execution) =
            TraceRecorder::scope(name, self.store, recorder_config, |trace| {
                run_steps(trace, &normalized, dataset)
            })?;

        Ok(WorkflowRun {
            execution,
            rows: rows.into_iter().map(|row| row.entity).collect(),
        })
    }
}

fn run_steps(
    trace: &mut TraceRecorder<'_>,
    workflow: &NormalizedWorkflow,
    dataset: &[Entity],
) -> Result<Vec<Row>> {
    let definition = &workflow.definition;
    trace.add_metadata("workflow_id", definition.workflow_id.as_str())?;
    trace.add_metadata("workflow_name", definition.name.as_str())?;
    trace.add_metadata("workflow_hash", workflow.workflow_hash.as_str())?;
    trace.add_metadata("dataset_size", dataset.len())?;
    trace.add_metadata("workflow_definition", workflow.normalized_json.clone())?;
    if !workflow.warnings.is_empty() {
        for warning in &workflow.warnings {
            warn!(workflow_id = %definition.workflow_id, "{warning}");
        }
        trace.add_metadata("workflow_warnings", workflow.warnings.clone())?;
    }

    let mut current: Vec<Row> = dataset
        .iter()
        .cloned()
        .enumerate()
        .map(|(position, entity)| Row { position, entity })
        .collect();

    for spec in &definition.steps {
        let input = json!({
            "input_count": current.len(),
            "input_fields": spec.input_fields,
            "rule": spec.rule,
        });
        let result = match spec.step_type.as_str() {
            "filter" => filter_step(spec, current),
            "ranking" => ranking_step(spec, current),
            "transformation" => transformation_step(spec, current),
            other => {
                warn!(step = %spec.id, step_type = other, "unknown workflow step type, passing data through");
                StepResult {
                    kind: StepKind::General,
                    output: json!({"message": format!("Unknown step type: {other}")}),
                    reasoning: String::new(),
                    evaluations: Vec::new(),
                    rows: current,
                }
            }
        };

        trace.record_step(
            StepDraft::new(spec.id.as_str(), result.kind)
                .input(input)
                .rules(vec![AppliedRule {
                    name: spec.label.clone(),
                    kind: spec.step_type.clone(),
                    definition: spec.rule.clone(),
                    source: WORKFLOW_RULE_SOURCE.to_string(),
                }])
                .evaluations(result.evaluations)
                .output(result.output)
                .reasoning(result.reasoning),
        )?;
        current = result.rows;
    }
    Ok(current)
}

/// A filter with nothing to check accepts every row, the same vacuous pass a
/// rule source without filters gets.
fn unchecked_filter_step(spec: &StepSpec, rows: Vec<Row>, note: &str) -> StepResult {
    warn!(step = %spec.id, "{note}");
    let total = rows.len();
    let evaluations = rows
        .iter()
        .map(|row| evaluation_for(row, Vec::new()))
        .collect();
    StepResult {
        kind: StepKind::Filter,
        output: json!({
            "total": total,
            "passed": total,
            "failed": 0,
            "note": note,
        }),
        reasoning: format!("{}: {note}; {total} passed, 0 failed out of {total} total", spec.label),
        evaluations,
        rows,
    }
}

fn filter_step(spec: &StepSpec, rows: Vec<Row>) -> StepResult {
    if !spec.rule.is_object() {
        return unchecked_filter_step(
            spec,
            rows,
            "Rule is not a mapping, no condition was applied",
        );
    }
    if spec.input_fields.is_empty() {
        return unchecked_filter_step(spec, rows, "No input fields declared, every row passes");
    }
    let operator_text = spec
        .rule
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or("==");
    let operator = Operator::parse(operator_text);
    if let Operator::Unrecognized(raw) = &operator {
        warn!(step = %spec.id, operator = %raw, "unknown workflow operator, conditions fail closed");
    }
    let expected = spec.rule.get("value").cloned().unwrap_or(Value::Null);
    let expected_text = render_value(&expected);

    let total = rows.len();
    let mut passed = Vec::new();
    let mut evaluations = Vec::with_capacity(total);
    for row in rows {
        let checks: Vec<Check> = spec
            .input_fields
            .iter()
            .map(|field| {
                let rule = format!("{field} {operator_text} {expected_text}");
                let expected_line = format!("{field} should be {operator_text} {expected_text}");
                match row.entity.lookup(field) {
                    None => Check {
                        rule,
                        passed: false,
                        expected: expected_line,
                        actual: format!("Field '{field}' not found"),
                        reason: format!("Field '{field}' does not exist in row"),
                    },
                    Some(value) => {
                        let ok = evaluate_condition(value, &operator, &expected);
                        Check {
                            rule,
                            passed: ok,
                            expected: expected_line,
                            actual: value.to_string(),
                            reason: if ok {
                                "Passed".to_string()
                            } else {
                                format!("Value {value} does not satisfy {operator_text} {expected_text}")
                            },
                        }
                    }
                }
            })
            .collect();

        let evaluation = evaluation_for(&row, checks);
        if evaluation.is_accepted() {
            passed.push(row);
        }
        evaluations.push(evaluation);
    }

    let survivors = passed.len();
    StepResult {
        kind: StepKind::Filter,
        output: json!({
            "total": total,
            "passed": survivors,
            "failed": total - survivors,
        }),
        reasoning: format!(
            "{}: {survivors} passed, {} failed out of {total} total",
            spec.label,
            total - survivors
        ),
        evaluations,
        rows: passed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_lowercase()).as_deref() {
            Some("asc" | "ascending") => Self::Asc,
            _ => Self::Desc,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

fn ranking_step(spec: &StepSpec, rows: Vec<Row>) -> StepResult {
    if spec.input_fields.is_empty() {
        return StepResult {
            kind: StepKind::Ranking,
            output: json!({"message": "No ranking fields specified"}),
            reasoning: format!("{}: No ranking performed (no fields specified)", spec.label),
            evaluations: Vec::new(),
            rows,
        };
    }

    let direction = Direction::parse(spec.rule.get("order").and_then(Value::as_str));
    let limit = spec
        .rule
        .get("limit")
        .and_then(Value::as_u64)
        .and_then(|limit| usize::try_from(limit).ok())
        .filter(|limit| *limit > 0);

    let mut sorted = rows;
    sorted.sort_by(|lhs, rhs| compare_rows(&lhs.entity, &rhs.entity, &spec.input_fields, direction));
    if let Some(limit) = limit {
        sorted.truncate(limit);
    }

    let fields = spec.input_fields.join(", ");
    let order = direction.as_str();
    let evaluations = sorted
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let rank = index + 1;
            let score = additive_score(&row.entity, &spec.input_fields);
            let check = Check {
                rule: format!("Rank by {fields} ({order})"),
                passed: true,
                expected: format!("Rank {rank}"),
                actual: format!("Rank {rank} with score {score}"),
                reason: format!("Ranked {rank} based on {fields}"),
            };
            let mut evaluation = evaluation_for(row, vec![check]);
            evaluation.rank = Some(rank);
            evaluation.score = Some(score);
            evaluation
        })
        .collect();

    let mut output = json!({
        "total_ranked": sorted.len(),
        "ranking_fields": spec.input_fields,
        "order": order,
    });
    if !spec.rule.is_object() {
        output["note"] = json!("Rule is not a mapping, default order and no limit applied");
    }

    StepResult {
        kind: StepKind::Ranking,
        output,
        reasoning: format!(
            "{}: Ranked {} items by {fields} ({order})",
            spec.label,
            sorted.len()
        ),
        evaluations,
        rows: sorted,
    }
}

fn transformation_step(spec: &StepSpec, rows: Vec<Row>) -> StepResult {
    StepResult {
        kind: StepKind::Transformation,
        output: json!({"message": "Transformation step executed"}),
        reasoning: format!("{}: Processed {} items", spec.label, rows.len()),
        evaluations: Vec::new(),
        rows,
    }
}

fn evaluation_for(row: &Row, checks: Vec<Check>) -> Evaluation {
    Evaluation::from_checks(
        row.entity.entity_id(row.position),
        row.entity.display_name(row.position),
        row.entity.attributes(),
        checks,
    )
}

/// Order two rows by the ranking fields. Missing values sort last in either
/// direction; ties keep input order.
fn compare_rows(lhs: &Entity, rhs: &Entity, fields: &[String], direction: Direction) -> Ordering {
    for field in fields {
        let left = lhs.lookup(field).filter(|value| !value.is_null());
        let right = rhs.lookup(field).filter(|value| !value.is_null());
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(left), Some(right)) => {
                let natural = sort_order(left, right);
                match direction {
                    Direction::Asc => natural,
                    Direction::Desc => natural.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Total order over present values: numbers before text, numbers natively,
/// text case-insensitively.
fn sort_order(left: &Scalar, right: &Scalar) -> Ordering {
    match (sortable_number(left), sortable_number(right)) {
        (Some(left), Some(right)) => left.total_cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.folded().cmp(&right.folded()),
    }
}

fn sortable_number(value: &Scalar) -> Option<f64> {
    match value {
        Scalar::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        other => other.as_number(),
    }
}

fn additive_score(entity: &Entity, fields: &[String]) -> f64 {
    fields
        .iter()
        .filter_map(|field| entity.lookup(field).and_then(Scalar::as_number))
        .sum()
}

/// Comparison operators accepted by workflow filter steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Gt,
    Ge,
    Lt,
    Le,
    Unrecognized(String),
}

impl Operator {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            _ => Self::Unrecognized(raw.to_string()),
        }
    }
}

/// Evaluate `value <operator> expected`. Text on either side compares trimmed
/// and case-insensitively; otherwise values compare natively. Comparisons that
/// have no meaning (ordering against null, membership in a non-list) fail.
#[must_use]
pub fn evaluate_condition(value: &Scalar, operator: &Operator, expected: &Value) -> bool {
    let target = Scalar::from_json(expected);
    let textual = value.is_text() || target.is_text();
    match operator {
        Operator::Eq => equal(value, &target, textual),
        Operator::Ne => !equal(value, &target, textual),
        Operator::Contains => value.folded().contains(&target.folded()),
        Operator::NotContains => !value.folded().contains(&target.folded()),
        Operator::StartsWith => value.folded().starts_with(&target.folded()),
        Operator::EndsWith => value.folded().ends_with(&target.folded()),
        Operator::In => member(value, expected).unwrap_or(false),
        Operator::NotIn => !member(value, expected).unwrap_or(false),
        Operator::Gt => ordered(value, &target, textual).is_some_and(Ordering::is_gt),
        Operator::Ge => ordered(value, &target, textual).is_some_and(Ordering::is_ge),
        Operator::Lt => ordered(value, &target, textual).is_some_and(Ordering::is_lt),
        Operator::Le => ordered(value, &target, textual).is_some_and(Ordering::is_le),
        Operator::Unrecognized(_) => UNKNOWN_OPERATOR_PASSES,
    }
}

fn equal(value: &Scalar, target: &Scalar, textual: bool) -> bool {
    if textual {
        return value.folded() == target.folded();
    }
    match (value, target) {
        (Scalar::Null, Scalar::Null) => true,
        _ => native_order(value, target) == Some(Ordering::Equal),
    }
}

fn ordered(value: &Scalar, target: &Scalar, textual: bool) -> Option<Ordering> {
    if textual {
        return Some(value.folded().cmp(&target.folded()));
    }
    native_order(value, target)
}

fn native_order(left: &Scalar, right: &Scalar) -> Option<Ordering> {
    match (left, right) {
        (Scalar::Int(left), Scalar::Int(right)) => Some(left.cmp(right)),
        (Scalar::Null, _) | (_, Scalar::Null) => None,
        _ => sortable_number(left)?.partial_cmp(&sortable_number(right)?),
    }
}

/// `Some(found)` when `expected` is a list, `None` otherwise.
fn member(value: &Scalar, expected: &Value) -> Option<bool> {
    let Value::Array(items) = expected else {
        return None;
    };
    let found = items.iter().map(Scalar::from_json).any(|item| {
        if value.is_text() {
            value.folded() == item.folded()
        } else {
            equal(value, &item, false)
        }
    });
    Some(found)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn rule_source_label(rules: &RuleSet) -> &'static str {
    rules.source_kind().map_or("inline", RuleSourceKind::as_str)
}

/// Apply the rule-source filters for `step_name` and record the result as a
/// filter step.
///
/// # Errors
/// Returns an error when the recorder is not active or a rule cannot be
/// serialized.
pub fn record_rule_filter_step(
    trace: &mut TraceRecorder<'_>,
    rules: &RuleSet,
    step_name: &str,
    candidates: &[Entity],
) -> Result<FilterOutcome> {
    let outcome = apply_filters(candidates, rules, Some(step_name));
    let filters = rules.filters(Some(step_name));
    let reasoning = filter_reasoning(&outcome.evaluations, &filters, Some(step_name));
    let source = rule_source_label(rules);
    let applied = filters
        .iter()
        .map(|rule| -> Result<AppliedRule> {
            Ok(AppliedRule {
                name: rule.name.clone(),
                kind: rule.kind.as_str().to_string(),
                definition: serde_json::to_value(rule)?,
                source: source.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    trace.record_step(
        StepDraft::new(step_name, StepKind::Filter)
            .input(json!({"candidates_count": candidates.len()}))
            .rules(applied)
            .evaluations(outcome.evaluations.clone())
            .output(json!({
                "total_evaluated": outcome.total_evaluated,
                "passed": outcome.passed,
                "failed": outcome.failed,
                "qualified": outcome.qualified,
                "filters_applied": outcome.filters_applied,
            }))
            .reasoning(reasoning),
    )?;
    Ok(outcome)
}

/// Rank `evaluations` with the criteria configured for `step_name` (or the
/// fallback criteria) and record the result as a ranking step.
///
/// # Errors
/// Returns an error when the recorder is not active or the outcome cannot be
/// serialized.
pub fn record_rule_ranking_step(
    trace: &mut TraceRecorder<'_>,
    rules: &RuleSet,
    step_name: &str,
    evaluations: &[Evaluation],
) -> Result<RankingOutcome> {
    let outcome = rank_with_rules(evaluations, rules, Some(step_name));
    let reasoning = ranking_reasoning(&outcome);
    let selected_item = match outcome.selection.as_ref() {
        Some(selection) => json!({
            "id": selection.entity_id,
            "name": selection.entity_name,
            "rank": selection.rank,
            "composite_score": selection.composite_score,
            "reason": selection.reason,
        }),
        None => Value::Null,
    };
    let ranked: Vec<Evaluation> = outcome
        .candidates
        .iter()
        .map(|candidate| candidate.ranked_evaluation())
        .collect();

    trace.record_step(
        StepDraft::new(step_name, StepKind::Ranking)
            .input(json!({"candidates_count": evaluations.len()}))
            .rules(vec![AppliedRule {
                name: format!("{step_name}_criteria"),
                kind: "ranking".to_string(),
                definition: serde_json::to_value(&outcome.criteria)?,
                source: rule_source_label(rules).to_string(),
            }])
            .evaluations(ranked)
            .output(json!({
                "ranked_count": outcome.candidates.len(),
                "selected_item": selected_item,
                "note": outcome.note,
            }))
            .reasoning(reasoning),
    )?;
    Ok(outcome)
}
