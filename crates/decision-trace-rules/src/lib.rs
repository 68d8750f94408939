#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use decision_trace_domain::{
    Check, Comparator, Entity, Evaluation, RankedCandidate, RankingCriteria, RankingOutcome, Rule,
    RuleKind, Scalar, Selection,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Rules with a comparator this crate does not know are treated as satisfied.
pub const UNKNOWN_COMPARATOR_PASSES: bool = true;

pub const PRIMARY_WEIGHT: f64 = 0.5;
pub const SECONDARY_WEIGHT: f64 = 0.3;
pub const TERTIARY_WEIGHT: f64 = 0.2;

/// Where a rule set comes from. Loading never fails: unreadable or malformed
/// sources degrade to an empty rule set.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleSource {
    CsvPath(PathBuf),
    JsonPath(PathBuf),
    Document(Value),
    Rows(Vec<Value>),
    RemoteSheet(String),
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleSourceKind {
    Csv,
    Json,
    Document,
    Rows,
    RemoteSheet,
}

impl RuleSourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Document => "document",
            Self::Rows => "rows",
            Self::RemoteSheet => "remote_sheet",
        }
    }
}

impl RuleSource {
    /// Classify a textual reference: `.json` paths, `.csv` paths, spreadsheet
    /// URLs or bare sheet ids. Anything else is read as a CSV path.
    #[must_use]
    pub fn detect(reference: &str) -> Self {
        let trimmed = reference.trim();
        let lowered = trimmed.to_lowercase();
        if lowered.ends_with(".json") {
            return Self::JsonPath(PathBuf::from(trimmed));
        }
        if lowered.ends_with(".csv") {
            return Self::CsvPath(PathBuf::from(trimmed));
        }
        if lowered.contains("docs.google.com") || lowered.contains("drive.google.com") {
            return Self::RemoteSheet(trimmed.to_string());
        }
        let looks_like_sheet_id = trimmed.len() > 10
            && !trimmed.contains('/')
            && !trimmed.contains('\\')
            && !trimmed.contains('.');
        if looks_like_sheet_id {
            return Self::RemoteSheet(trimmed.to_string());
        }
        Self::CsvPath(PathBuf::from(trimmed))
    }

    #[must_use]
    pub fn kind(&self) -> RuleSourceKind {
        match self {
            Self::CsvPath(_) => RuleSourceKind::Csv,
            Self::JsonPath(_) => RuleSourceKind::Json,
            Self::Document(_) => RuleSourceKind::Document,
            Self::Rows(_) => RuleSourceKind::Rows,
            Self::RemoteSheet(_) => RuleSourceKind::RemoteSheet,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
    source_kind: Option<RuleSourceKind>,
}

impl RuleSet {
    #[must_use]
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            source_kind: None,
        }
    }

    /// Load and normalize rules from `source`. Failures are logged and produce
    /// an empty set so evaluation can continue permissively.
    #[must_use]
    pub fn load(source: &RuleSource) -> Self {
        let rows = match read_rows(source) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(source = ?source.kind(), error = %err, "rule source unavailable, continuing without rules");
                Vec::new()
            }
        };
        let rules = normalize_rows(&rows);
        debug!(source = ?source.kind(), count = rules.len(), "loaded rules");
        Self {
            rules,
            source_kind: Some(source.kind()),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn source_kind(&self) -> Option<RuleSourceKind> {
        self.source_kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Filter rules, optionally narrowed to one step (case-insensitive).
    #[must_use]
    pub fn filters(&self, step: Option<&str>) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.kind == RuleKind::Filter && step_matches(rule, step))
            .collect()
    }

    /// Criteria of the first ranking rule for `step`, if any.
    #[must_use]
    pub fn ranking_criteria(&self, step: Option<&str>) -> Option<RankingCriteria> {
        self.rules
            .iter()
            .find(|rule| rule.kind == RuleKind::Ranking && step_matches(rule, step))
            .map(|rule| RankingCriteria {
                primary: rule.primary.clone(),
                secondary: rule.secondary.clone(),
                tertiary: rule.tertiary.clone(),
            })
    }
}

fn step_matches(rule: &Rule, step: Option<&str>) -> bool {
    match step {
        Some(step) => rule.step.eq_ignore_ascii_case(step.trim()),
        None => true,
    }
}

fn read_rows(source: &RuleSource) -> Result<Vec<Value>> {
    match source {
        RuleSource::CsvPath(path) => read_csv_rows(path),
        RuleSource::JsonPath(path) => read_json_rows(path),
        RuleSource::Document(document) => Ok(document_rows(document)),
        RuleSource::Rows(rows) => Ok(rows.clone()),
        RuleSource::RemoteSheet(reference) => Err(anyhow!(
            "remote sheet {reference} cannot be fetched; export it as CSV"
        )),
    }
}

fn read_csv_rows(path: &Path) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open rules file {}", path.display()))?;
    let headers = reader
        .headers()
        .context("failed to read rules header row")?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read rules row")?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| (header.to_string(), Value::String(cell.to_string())))
            .collect();
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

fn read_json_rows(path: &Path) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    let document: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse rules file {}", path.display()))?;
    match document {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut object) => match object.remove("rules") {
            Some(Value::Array(rows)) => Ok(rows),
            _ => Err(anyhow!(
                "rules document {} has no `rules` list",
                path.display()
            )),
        },
        _ => Err(anyhow!("rules document {} is not a list", path.display())),
    }
}

/// A pre-parsed document is either `{"rules": [...]}`, a single rule mapping
/// or a list of rule mappings.
fn document_rows(document: &Value) -> Vec<Value> {
    match document {
        Value::Array(rows) => rows.clone(),
        Value::Object(object) => match object.get("rules") {
            Some(Value::Array(rows)) => rows.clone(),
            _ if object.is_empty() => Vec::new(),
            _ => vec![document.clone()],
        },
        _ => Vec::new(),
    }
}

/// Normalize raw rows into typed rules. Rows whose `type` is neither filter
/// nor ranking are ignored.
#[must_use]
pub fn normalize_rows(rows: &[Value]) -> Vec<Rule> {
    rows.iter()
        .filter_map(|row| match row {
            Value::Object(object) => rule_from_row(object),
            other => {
                warn!(row = %other, "ignoring rule row that is not a mapping");
                None
            }
        })
        .collect()
}

fn rule_from_row(row: &Map<String, Value>) -> Option<Rule> {
    let raw_kind = row_text(row, "type");
    let Some(kind) = RuleKind::parse(&raw_kind) else {
        debug!(rule_type = %raw_kind, "ignoring rule row with unknown type");
        return None;
    };
    let name = match row_text(row, "name") {
        name if name.is_empty() => format!("unnamed_{}", kind.as_str()),
        name => name,
    };
    Some(Rule {
        step: row_text(row, "step"),
        kind,
        name,
        field: row_text(row, "field"),
        comparator: Comparator::parse(&row_text(row, "rule_type")),
        value: row_bound(row, "value"),
        min: row_bound(row, "min"),
        max: row_bound(row, "max"),
        primary: row_optional_text(row, "primary"),
        secondary: row_optional_text(row, "secondary"),
        tertiary: row_optional_text(row, "tertiary"),
        description: row_text(row, "description"),
    })
}

fn row_text(row: &Map<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn row_optional_text(row: &Map<String, Value>, key: &str) -> Option<String> {
    let text = row_text(row, key);
    (!text.is_empty()).then_some(text)
}

fn row_bound(row: &Map<String, Value>, key: &str) -> Option<Scalar> {
    match row.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) if text.trim().is_empty() => None,
        Some(Value::String(text)) => Some(Scalar::coerce_text(text)),
        Some(other) => Some(Scalar::from_json(other)),
    }
}

/// Order two scalars. Text on either side compares case-insensitively as
/// text; numbers (and booleans as 0/1) compare numerically; null never orders.
fn compare_scalars(actual: &Scalar, expected: &Scalar) -> Option<Ordering> {
    if actual.is_null() || expected.is_null() {
        return None;
    }
    if actual.is_text() || expected.is_text() {
        return Some(actual.folded().cmp(&expected.folded()));
    }
    match (actual, expected) {
        (Scalar::Int(lhs), Scalar::Int(rhs)) => Some(lhs.cmp(rhs)),
        _ => numeric(actual)?.partial_cmp(&numeric(expected)?),
    }
}

fn numeric(value: &Scalar) -> Option<f64> {
    match value {
        Scalar::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        other => other.as_number(),
    }
}

fn scalars_equal(actual: &Scalar, expected: &Scalar) -> bool {
    if actual.is_null() && expected.is_null() {
        return true;
    }
    compare_scalars(actual, expected) == Some(Ordering::Equal)
}

/// Evaluate one filter rule against one entity.
#[must_use]
pub fn evaluate(entity: &Entity, rule: &Rule) -> Check {
    let expected = rule.expected_text();
    let field = rule.field.as_str();
    let found = if field.trim().is_empty() {
        None
    } else {
        entity.lookup(field)
    };
    let Some(actual) = found else {
        return Check {
            rule: rule.name.clone(),
            passed: false,
            expected,
            actual: format!("{field} = N/A"),
            reason: format!("Field \"{field}\" not found in entity"),
        };
    };

    let (passed, reason) = compare(actual, rule);
    Check {
        rule: rule.name.clone(),
        passed,
        expected,
        actual: format!("{field} = {actual}"),
        reason,
    }
}

fn compare(actual: &Scalar, rule: &Rule) -> (bool, String) {
    let field = &rule.field;
    match (&rule.comparator, &rule.value, &rule.min, &rule.max) {
        (Comparator::Range, _, Some(min), Some(max)) => {
            let above = matches!(
                compare_scalars(actual, min),
                Some(Ordering::Greater | Ordering::Equal)
            );
            let below = matches!(
                compare_scalars(actual, max),
                Some(Ordering::Less | Ordering::Equal)
            );
            if above && below {
                (true, format!("{field} {actual} is within range {min}-{max}"))
            } else {
                (false, format!("{field} {actual} is outside range {min}-{max}"))
            }
        }
        (Comparator::Min, Some(bound), _, _) => {
            match compare_scalars(actual, bound) {
                Some(Ordering::Greater | Ordering::Equal) => {
                    (true, format!("{field} {actual} is at least {bound}"))
                }
                Some(Ordering::Less) => (false, format!("{field} {actual} is below minimum {bound}")),
                None => (false, format!("{field} {actual} cannot be compared with {bound}")),
            }
        }
        (Comparator::Max, Some(bound), _, _) => {
            match compare_scalars(actual, bound) {
                Some(Ordering::Less | Ordering::Equal) => {
                    (true, format!("{field} {actual} is at most {bound}"))
                }
                Some(Ordering::Greater) => {
                    (false, format!("{field} {actual} is above maximum {bound}"))
                }
                None => (false, format!("{field} {actual} cannot be compared with {bound}")),
            }
        }
        (Comparator::Equals, Some(bound), _, _) => {
            if scalars_equal(actual, bound) {
                (true, format!("{field} {actual} equals {bound}"))
            } else {
                (false, format!("{field} {actual} does not equal {bound}"))
            }
        }
        (Comparator::Contains, Some(bound), _, _) => {
            if actual.folded().contains(&bound.folded()) {
                (true, format!("\"{bound}\" found in {field} \"{actual}\""))
            } else {
                (false, format!("\"{bound}\" not found in {field} \"{actual}\""))
            }
        }
        (Comparator::Unrecognized(raw), _, _, _) => (
            UNKNOWN_COMPARATOR_PASSES,
            format!("Unknown rule type: {raw}"),
        ),
        (comparator, _, _, _) => (
            UNKNOWN_COMPARATOR_PASSES,
            format!(
                "Incomplete {} rule for {field}; bounds missing",
                comparator.as_str()
            ),
        ),
    }
}

/// Evaluate every entity against every filter rule. With no filter rules each
/// entity is vacuously accepted.
#[must_use]
pub fn evaluate_all(entities: &[Entity], rules: &[&Rule]) -> Vec<Evaluation> {
    entities
        .iter()
        .enumerate()
        .map(|(position, entity)| {
            let checks = rules
                .iter()
                .filter(|rule| rule.kind == RuleKind::Filter)
                .map(|rule| evaluate(entity, rule))
                .collect();
            Evaluation::from_checks(
                entity.entity_id(position),
                entity.display_name(position),
                entity.attributes(),
                checks,
            )
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FilterOutcome {
    pub evaluations: Vec<Evaluation>,
    pub qualified: Vec<String>,
    pub filters_applied: Map<String, Value>,
    pub total_evaluated: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Run the filter rules of `step` over `entities` and tally the result.
#[must_use]
pub fn apply_filters(entities: &[Entity], rules: &RuleSet, step: Option<&str>) -> FilterOutcome {
    let filters = rules.filters(step);
    let evaluations = evaluate_all(entities, &filters);
    let qualified: Vec<String> = evaluations
        .iter()
        .filter(|evaluation| evaluation.is_accepted())
        .map(|evaluation| evaluation.entity_id.clone())
        .collect();
    let filters_applied = filters
        .iter()
        .map(|rule| (rule.name.clone(), Value::String(rule.expected_text())))
        .collect();
    let passed = qualified.len();
    FilterOutcome {
        total_evaluated: evaluations.len(),
        failed: evaluations.len() - passed,
        passed,
        qualified,
        filters_applied,
        evaluations,
    }
}

/// Rank evaluations by (all filters passed, filters passed, composite score),
/// all descending, ties kept in input order.
#[must_use]
pub fn rank(evaluations: &[Evaluation], criteria: &RankingCriteria) -> RankingOutcome {
    if evaluations.is_empty() {
        return RankingOutcome {
            criteria: criteria.clone(),
            candidates: Vec::new(),
            selection: None,
            note: Some("No candidates to rank".to_string()),
        };
    }

    let [primary, secondary, tertiary] = criteria.fields();
    let primary_scores = normalized_scores(evaluations, primary);
    let secondary_scores = normalized_scores(evaluations, secondary);
    let tertiary_scores = normalized_scores(evaluations, tertiary);

    let mut candidates: Vec<RankedCandidate> = evaluations
        .iter()
        .enumerate()
        .map(|(index, evaluation)| {
            let composite_score = PRIMARY_WEIGHT * primary_scores[index]
                + SECONDARY_WEIGHT * secondary_scores[index]
                + TERTIARY_WEIGHT * tertiary_scores[index];
            RankedCandidate {
                evaluation: evaluation.clone(),
                primary_score: primary_scores[index],
                secondary_score: secondary_scores[index],
                tertiary_score: tertiary_scores[index],
                composite_score,
                rank: 0,
                selected: false,
            }
        })
        .collect();

    candidates.sort_by(|lhs, rhs| {
        fully_passed(&rhs.evaluation)
            .cmp(&fully_passed(&lhs.evaluation))
            .then(rhs.evaluation.filters_passed.cmp(&lhs.evaluation.filters_passed))
            .then(rhs.composite_score.total_cmp(&lhs.composite_score))
    });
    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = index + 1;
        candidate.selected = index == 0;
    }

    let selection = candidates
        .first()
        .map(|top| selection_for(top, criteria));
    RankingOutcome {
        criteria: criteria.clone(),
        candidates,
        selection,
        note: None,
    }
}

/// Rank with the criteria configured for `step`, or the fallback criteria.
#[must_use]
pub fn rank_with_rules(
    evaluations: &[Evaluation],
    rules: &RuleSet,
    step: Option<&str>,
) -> RankingOutcome {
    let criteria = rules
        .ranking_criteria(step)
        .unwrap_or_else(RankingCriteria::fallback);
    rank(evaluations, &criteria)
}

fn fully_passed(evaluation: &Evaluation) -> bool {
    evaluation.filters_passed == evaluation.filters_total
}

fn criterion_value(evaluation: &Evaluation, field: &str) -> f64 {
    evaluation
        .attributes
        .lookup(field)
        .and_then(Scalar::as_number)
        .unwrap_or(0.0)
}

fn normalized_scores(evaluations: &[Evaluation], field: Option<&str>) -> Vec<f64> {
    let Some(field) = field else {
        return vec![0.0; evaluations.len()];
    };
    let values: Vec<f64> = evaluations
        .iter()
        .map(|evaluation| criterion_value(evaluation, field))
        .collect();
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > 0.0 {
        values.iter().map(|value| value / max).collect()
    } else {
        vec![0.0; values.len()]
    }
}

fn selection_for(top: &RankedCandidate, criteria: &RankingCriteria) -> Selection {
    let evaluation = &top.evaluation;
    let standing = if evaluation.filters_total == 0 {
        "No filters applied".to_string()
    } else if fully_passed(evaluation) {
        format!("Passed all {} filters", evaluation.filters_total)
    } else {
        format!(
            "Passed {}/{} filters",
            evaluation.filters_passed, evaluation.filters_total
        )
    };
    let reason = match criteria.primary.as_deref() {
        Some(primary) => {
            let value = evaluation
                .attributes
                .lookup(primary)
                .map_or_else(|| "N/A".to_string(), ToString::to_string);
            format!("{standing} - highest {primary} ({value})")
        }
        None => format!("{standing} - best composite score"),
    };
    Selection {
        entity_id: evaluation.entity_id.clone(),
        entity_name: evaluation.entity_name.clone(),
        rank: top.rank,
        composite_score: top.composite_score,
        reason,
    }
}
