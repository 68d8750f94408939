#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Metadata keys the recorder owns. They are lifted into dedicated fields of the
/// canonical execution and never echoed back inside `metadata`.
pub const RESERVED_METADATA_KEYS: [&str; 4] = ["name", "started_at", "ended_at", "completed_at"];

pub const UNNAMED_EXECUTION: &str = "unnamed_execution";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A single attribute value carried by an entity or a rule bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Coerce raw tabular text: a decimal point means float, otherwise try an
    /// integer, otherwise keep the text.
    #[must_use]
    pub fn coerce_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.contains('.') {
            if let Ok(parsed) = trimmed.parse::<f64>() {
                return Self::Float(parsed);
            }
        } else if let Ok(parsed) = trimmed.parse::<i64>() {
            return Self::Int(parsed);
        }
        Self::Text(raw.to_string())
    }

    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(_) | Value::Object(_) => Self::Text(value.to_string()),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Int(number) => Value::from(*number),
            Self::Float(number) => serde_json::Number::from_f64(*number)
                .map_or(Value::Null, Value::Number),
            Self::Text(text) => Value::String(text.clone()),
        }
    }

    /// Numeric view of integer and float values. Booleans and text are not numbers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(number) => Some(*number as f64),
            Self::Float(number) => Some(*number),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Trimmed, lowercased rendering used for case-insensitive comparisons.
    #[must_use]
    pub fn folded(&self) -> String {
        match self {
            Self::Text(text) => text.trim().to_lowercase(),
            other => other.to_string().to_lowercase(),
        }
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(number) => write!(f, "{number}"),
            Self::Float(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// An ordered mapping of field names to scalar values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Entity(IndexMap<String, Scalar>);

impl Entity {
    #[must_use]
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Option<Scalar> {
        self.0.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.0.get(key)
    }

    /// Case-insensitive field lookup. An exact match wins over a folded one.
    #[must_use]
    pub fn lookup(&self, field: &str) -> Option<&Scalar> {
        if let Some(value) = self.0.get(field) {
            return Some(value);
        }
        let folded = field.to_lowercase();
        self.0
            .iter()
            .find(|(key, _)| key.to_lowercase() == folded)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first non-empty `id` or `_id` value, rendered as text.
    #[must_use]
    pub fn explicit_id(&self) -> Option<String> {
        ["id", "_id"].iter().find_map(|key| match self.0.get(*key) {
            None | Some(Scalar::Null) => None,
            Some(value) => {
                let rendered = value.to_string();
                (!rendered.trim().is_empty()).then_some(rendered)
            }
        })
    }

    #[must_use]
    pub fn entity_id(&self, position: usize) -> String {
        self.explicit_id().unwrap_or_else(|| position.to_string())
    }

    #[must_use]
    pub fn display_name(&self, position: usize) -> String {
        ["name", "title"]
            .iter()
            .find_map(|key| match self.lookup(key) {
                Some(Scalar::Text(text)) if !text.trim().is_empty() => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_else(|| self.entity_id(position))
    }

    /// Every field except the identity columns.
    #[must_use]
    pub fn attributes(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| key.as_str() != "id" && key.as_str() != "_id")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    /// # Errors
    /// Returns an error when the value is not a JSON object.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        match value {
            Value::Object(object) => Ok(Self::from(object.clone())),
            other => Err(DomainError::Validation(format!(
                "entity must be a JSON object, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(Map::from(self.clone()))
    }
}

impl From<Map<String, Value>> for Entity {
    fn from(object: Map<String, Value>) -> Self {
        Self(
            object
                .iter()
                .map(|(key, value)| (key.clone(), Scalar::from_json(value)))
                .collect(),
        )
    }
}

impl From<Entity> for Map<String, Value> {
    fn from(entity: Entity) -> Self {
        entity
            .0
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect()
    }
}

impl FromIterator<(String, Scalar)> for Entity {
    fn from_iter<T: IntoIterator<Item = (String, Scalar)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Filter,
    Ranking,
}

impl RuleKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Ranking => "ranking",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "filter" => Some(Self::Filter),
            "ranking" => Some(Self::Ranking),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Comparator {
    Range,
    Min,
    Max,
    Equals,
    Contains,
    Unrecognized(String),
}

impl Comparator {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "range" => Self::Range,
            "min" => Self::Min,
            "max" => Self::Max,
            "equals" => Self::Equals,
            "contains" => Self::Contains,
            _ => Self::Unrecognized(value.trim().to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Range => "range",
            Self::Min => "min",
            Self::Max => "max",
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }
}

impl From<String> for Comparator {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Comparator> for String {
    fn from(value: Comparator) -> Self {
        value.as_str().to_string()
    }
}

fn render_bound(value: Option<&Scalar>) -> String {
    value.map_or_else(|| "none".to_string(), ToString::to_string)
}

/// A normalized filter or ranking rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    #[serde(default)]
    pub step: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub name: String,
    #[serde(default)]
    pub field: String,
    #[serde(rename = "rule_type")]
    pub comparator: Comparator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tertiary: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl Rule {
    /// Machine-diffable statement of what the rule requires, e.g. `price <= 50`.
    #[must_use]
    pub fn expected_text(&self) -> String {
        let field = &self.field;
        match &self.comparator {
            Comparator::Range => format!(
                "{field} in [{}-{}]",
                render_bound(self.min.as_ref()),
                render_bound(self.max.as_ref())
            ),
            Comparator::Min => format!("{field} >= {}", render_bound(self.value.as_ref())),
            Comparator::Max => format!("{field} <= {}", render_bound(self.value.as_ref())),
            Comparator::Equals => format!("{field} == {}", render_bound(self.value.as_ref())),
            Comparator::Contains => {
                format!("{field} contains '{}'", render_bound(self.value.as_ref()))
            }
            Comparator::Unrecognized(raw) => {
                format!("{field} {raw} {}", render_bound(self.value.as_ref()))
            }
        }
    }

    /// Short condition used in rule listings, e.g. `≥4` or `10-20`.
    #[must_use]
    pub fn condition_text(&self) -> String {
        match &self.comparator {
            Comparator::Range => format!(
                "{}-{}",
                render_bound(self.min.as_ref()),
                render_bound(self.max.as_ref())
            ),
            Comparator::Min => format!("≥{}", render_bound(self.value.as_ref())),
            Comparator::Max => format!("≤{}", render_bound(self.value.as_ref())),
            Comparator::Equals => format!("={}", render_bound(self.value.as_ref())),
            Comparator::Contains => format!("contains '{}'", render_bound(self.value.as_ref())),
            Comparator::Unrecognized(raw) => {
                format!("{raw} {}", render_bound(self.value.as_ref()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankingCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tertiary: Option<String>,
}

impl RankingCriteria {
    /// Criteria used when no ranking rule is configured for a step.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            primary: Some("count".to_string()),
            secondary: Some("score".to_string()),
            tertiary: None,
        }
    }

    #[must_use]
    pub fn fields(&self) -> [Option<&str>; 3] {
        [
            self.primary.as_deref(),
            self.secondary.as_deref(),
            self.tertiary.as_deref(),
        ]
    }

    #[must_use]
    pub fn describe(&self) -> String {
        let parts: Vec<String> = ["primary", "secondary", "tertiary"]
            .iter()
            .zip(self.fields())
            .filter_map(|(label, field)| field.map(|field| format!("{label}: {field}")))
            .collect();
        if parts.is_empty() {
            "no criteria".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Check {
    pub rule: String,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

/// Outcome of checking one entity against a set of rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub attributes: Entity,
    #[serde(default)]
    pub checks: Vec<Check>,
    pub final_decision: Decision,
    #[serde(default)]
    pub filters_passed: usize,
    #[serde(default)]
    pub filters_total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Evaluation {
    /// Build an evaluation whose decision and counters are derived from `checks`:
    /// accepted exactly when every check passed, including the empty case.
    #[must_use]
    pub fn from_checks(
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        attributes: Entity,
        checks: Vec<Check>,
    ) -> Self {
        let filters_total = checks.len();
        let filters_passed = checks.iter().filter(|check| check.passed).count();
        let final_decision = if filters_passed == filters_total {
            Decision::Accepted
        } else {
            Decision::Rejected
        };
        Self {
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            attributes,
            checks,
            final_decision,
            filters_passed,
            filters_total,
            rank: None,
            score: None,
        }
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.final_decision == Decision::Accepted
    }

    #[must_use]
    pub fn passed_rule_names(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|check| check.passed)
            .map(|check| check.rule.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub evaluation: Evaluation,
    pub primary_score: f64,
    pub secondary_score: f64,
    pub tertiary_score: f64,
    pub composite_score: f64,
    pub rank: usize,
    pub selected: bool,
}

impl RankedCandidate {
    /// The underlying evaluation annotated with this candidate's rank and score.
    #[must_use]
    pub fn ranked_evaluation(&self) -> Evaluation {
        let mut evaluation = self.evaluation.clone();
        evaluation.rank = Some(self.rank);
        evaluation.score = Some(self.composite_score);
        evaluation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub entity_id: String,
    pub entity_name: String,
    pub rank: usize,
    pub composite_score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingOutcome {
    pub criteria: RankingCriteria,
    pub candidates: Vec<RankedCandidate>,
    pub selection: Option<Selection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Filter,
    Ranking,
    Transformation,
    General,
}

impl StepKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Ranking => "ranking",
            Self::Transformation => "transformation",
            Self::General => "general",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "filter" => Some(Self::Filter),
            "ranking" => Some(Self::Ranking),
            "transformation" => Some(Self::Transformation),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

/// The concrete rule a step applied, as it appears in the trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedRule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub definition: Value,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub rules: Vec<AppliedRule>,
    #[serde(default)]
    pub evaluations: Vec<Evaluation>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub reasoning: String,
    #[serde(with = "canonical_time")]
    pub started_at: DateTimeUtc,
    #[serde(with = "canonical_time")]
    pub ended_at: DateTimeUtc,
}

/// Canonical execution shape shared by every store and every reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: ExecutionId,
    pub name: String,
    #[serde(with = "canonical_time")]
    pub started_at: DateTimeUtc,
    #[serde(default, with = "canonical_time::option")]
    pub ended_at: Option<DateTimeUtc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub name: String,
    #[serde(with = "canonical_time")]
    pub started_at: DateTimeUtc,
    #[serde(default, with = "canonical_time::option")]
    pub ended_at: Option<DateTimeUtc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub steps_count: usize,
}

fn default_workflow_id() -> String {
    "generic_workflow".to_string()
}

fn default_workflow_name() -> String {
    "Generic Workflow".to_string()
}

fn default_step_type() -> String {
    "filter".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_step_type")]
    pub step_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub input_fields: Vec<String>,
    #[serde(default)]
    pub rule: Value,
}

/// A user-authored pipeline of filter, ranking and transformation steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,
    #[serde(default = "default_workflow_name")]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub name: String,
    pub steps_count: usize,
    #[serde(with = "canonical_time")]
    pub updated_at: DateTimeUtc,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Render a timestamp in canonical UTC RFC 3339 form.
///
/// # Errors
/// Returns an error when the timestamp cannot be represented in RFC 3339.
pub fn format_timestamp(value: DateTimeUtc) -> Result<String, DomainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| DomainError::Timestamp(err.to_string()))
}

/// Parse the timestamp shapes found in stored traces and convert them to UTC.
///
/// Accepts RFC 3339 with `Z` or an explicit offset, naive ISO date-times (with
/// or without fractional seconds, `T` or space separated, assumed UTC), bare
/// dates and integer or fractional epoch seconds. Anything else yields `None`.
#[must_use]
pub fn normalize_timestamp(raw: &str) -> Option<DateTimeUtc> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = trimmed.replacen(' ', "T", 1);
    if let Ok(parsed) = OffsetDateTime::parse(&candidate, &Rfc3339) {
        return Some(parsed.to_offset(UtcOffset::UTC));
    }

    let naive = PrimitiveDateTime::parse(
        &candidate,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            &candidate,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        )
    })
    .or_else(|_| {
        PrimitiveDateTime::parse(
            &candidate,
            format_description!("[year]-[month]-[day]T[hour]:[minute]"),
        )
    });
    if let Ok(parsed) = naive {
        return Some(parsed.assume_utc());
    }

    if let Ok(date) = Date::parse(trimmed, format_description!("[year]-[month]-[day]")) {
        return Some(date.midnight().assume_utc());
    }

    if let Ok(seconds) = trimmed.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(seconds).ok();
    }
    trimmed.parse::<f64>().ok().and_then(from_epoch_seconds)
}

/// JSON-aware variant of [`normalize_timestamp`]: strings are parsed, numbers
/// are epoch seconds, every other shape is unparseable.
#[must_use]
pub fn normalize_timestamp_value(value: &Value) -> Option<DateTimeUtc> {
    match value {
        Value::String(text) => normalize_timestamp(text),
        Value::Number(number) => match number.as_i64() {
            Some(seconds) => OffsetDateTime::from_unix_timestamp(seconds).ok(),
            None => number.as_f64().and_then(from_epoch_seconds),
        },
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch_seconds(seconds: f64) -> Option<DateTimeUtc> {
    if !seconds.is_finite() {
        return None;
    }
    let nanos = (seconds * 1_000_000_000.0).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

/// Serde adapter that writes canonical UTC RFC 3339 and reads every shape
/// [`normalize_timestamp_value`] understands.
pub mod canonical_time {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    use super::{format_timestamp, normalize_timestamp_value, DateTimeUtc};

    /// # Errors
    /// Returns an error when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(value: &DateTimeUtc, serializer: S) -> Result<S::Ok, S::Error> {
        let text = format_timestamp(*value).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    /// # Errors
    /// Returns an error when the value is not a recognizable timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTimeUtc, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        normalize_timestamp_value(&raw)
            .ok_or_else(|| D::Error::custom(format!("unrecognized timestamp: {raw}")))
    }

    pub mod option {
        use serde::ser::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};
        use serde_json::Value;

        use crate::{format_timestamp, normalize_timestamp_value, DateTimeUtc};

        /// # Errors
        /// Returns an error when the timestamp cannot be formatted.
        pub fn serialize<S: Serializer>(
            value: &Option<DateTimeUtc>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => {
                    let text = format_timestamp(*value).map_err(S::Error::custom)?;
                    serializer.serialize_some(&text)
                }
                None => serializer.serialize_none(),
            }
        }

        /// Unparseable values read back as `None` rather than failing the record.
        ///
        /// # Errors
        /// Returns an error only when the underlying deserializer fails.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTimeUtc>, D::Error> {
            let raw = Option::<Value>::deserialize(deserializer)?;
            Ok(raw.as_ref().and_then(normalize_timestamp_value))
        }
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn utc(text: &str) -> DateTimeUtc {
        let parsed = OffsetDateTime::parse(text, &Rfc3339);
        assert!(parsed.is_ok(), "fixture timestamp must parse: {text}");
        parsed.unwrap_or_else(|_| unreachable!())
    }

    fn check(passed: bool) -> Check {
        Check {
            rule: "rule".to_string(),
            passed,
            expected: "expected".to_string(),
            actual: "actual".to_string(),
            reason: "reason".to_string(),
        }
    }

    #[test]
    fn normalize_timestamp_accepts_rfc3339_with_zulu() {
        assert_eq!(
            normalize_timestamp("2025-01-20T10:15:00Z"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
    }

    #[test]
    fn normalize_timestamp_converts_offsets_to_utc() {
        assert_eq!(
            normalize_timestamp("2025-01-20T12:15:00+02:00"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
        assert_eq!(
            normalize_timestamp("2025-01-20T10:15:00+00:00"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
    }

    #[test]
    fn normalize_timestamp_assumes_utc_for_naive_values() {
        assert_eq!(
            normalize_timestamp("2025-01-20T10:15:00.123456"),
            Some(utc("2025-01-20T10:15:00.123456Z"))
        );
        assert_eq!(
            normalize_timestamp("2025-01-20T10:15:00"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
        assert_eq!(
            normalize_timestamp("2025-01-20 10:15:00"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
        assert_eq!(
            normalize_timestamp("2025-01-20T10:15"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
    }

    #[test]
    fn normalize_timestamp_accepts_dates_and_epochs() {
        assert_eq!(
            normalize_timestamp("2025-01-20"),
            Some(utc("2025-01-20T00:00:00Z"))
        );
        assert_eq!(
            normalize_timestamp("1737368100"),
            Some(utc("2025-01-20T10:15:00Z"))
        );
        assert_eq!(
            normalize_timestamp_value(&json!(1_737_368_100)),
            Some(utc("2025-01-20T10:15:00Z"))
        );
        assert_eq!(
            normalize_timestamp_value(&json!(1_737_368_100.5)),
            Some(utc("2025-01-20T10:15:00.5Z"))
        );
    }

    #[test]
    fn normalize_timestamp_rejects_garbage_without_inventing_a_time() {
        assert_eq!(normalize_timestamp(""), None);
        assert_eq!(normalize_timestamp("   "), None);
        assert_eq!(normalize_timestamp("yesterday"), None);
        assert_eq!(normalize_timestamp("2025-13-45T99:00:00"), None);
        assert_eq!(normalize_timestamp_value(&json!({"at": "now"})), None);
        assert_eq!(normalize_timestamp_value(&Value::Null), None);
    }

    #[test]
    fn format_timestamp_emits_zulu() {
        let rendered = format_timestamp(utc("2025-01-20T12:15:00+02:00"));
        assert_eq!(rendered, Ok("2025-01-20T10:15:00Z".to_string()));
    }

    #[test]
    fn scalar_coercion_follows_decimal_point() {
        assert_eq!(Scalar::coerce_text("4.5"), Scalar::Float(4.5));
        assert_eq!(Scalar::coerce_text("4"), Scalar::Int(4));
        assert_eq!(Scalar::coerce_text(" 12 "), Scalar::Int(12));
        assert_eq!(Scalar::coerce_text("1e5"), Scalar::Text("1e5".to_string()));
        assert_eq!(Scalar::coerce_text("v1.2"), Scalar::Text("v1.2".to_string()));
    }

    #[test]
    fn entity_lookup_is_case_insensitive() {
        let entity = Entity::new().with("Rating", 4.5).with("rating", 1.0);
        assert_eq!(entity.lookup("rating"), Some(&Scalar::Float(1.0)));
        assert_eq!(entity.lookup("RATING"), Some(&Scalar::Float(4.5)));
        assert_eq!(entity.lookup("price"), None);
    }

    #[test]
    fn entity_identity_falls_back_to_position() {
        let explicit = Entity::new().with("_id", "sku-9").with("title", "Kettle");
        assert_eq!(explicit.entity_id(3), "sku-9");
        assert_eq!(explicit.display_name(3), "Kettle");

        let anonymous = Entity::new().with("id", Scalar::Null).with("price", 10_i64);
        assert_eq!(anonymous.entity_id(3), "3");
        assert_eq!(anonymous.display_name(3), "3");
        assert!(anonymous.attributes().get("id").is_none());
    }

    #[test]
    fn entity_round_trips_through_json_objects() {
        let value = json!({"id": 7, "name": "Widget", "price": 9.5, "tags": ["a", "b"]});
        let entity = Entity::from_json(&value);
        assert!(entity.is_ok());
        let entity = entity.unwrap_or_else(|_| unreachable!());
        assert_eq!(entity.get("id"), Some(&Scalar::Int(7)));
        assert_eq!(entity.get("tags"), Some(&Scalar::Text("[\"a\",\"b\"]".to_string())));
        assert!(Entity::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn rule_expected_text_is_machine_diffable() {
        let rule = Rule {
            step: "screen".to_string(),
            kind: RuleKind::Filter,
            name: "price_band".to_string(),
            field: "price".to_string(),
            comparator: Comparator::Range,
            value: None,
            min: Some(Scalar::Int(10)),
            max: Some(Scalar::Float(20.5)),
            primary: None,
            secondary: None,
            tertiary: None,
            description: String::new(),
        };
        assert_eq!(rule.expected_text(), "price in [10-20.5]");
        assert_eq!(rule.condition_text(), "10-20.5");
    }

    #[test]
    fn comparator_keeps_unrecognized_spelling() {
        assert_eq!(Comparator::parse(" MIN "), Comparator::Min);
        let odd = Comparator::parse("between");
        assert_eq!(odd, Comparator::Unrecognized("between".to_string()));
        assert_eq!(odd.as_str(), "between");
    }

    #[test]
    fn execution_serializes_canonical_keys() {
        let started = utc("2025-01-20T10:15:00Z");
        let execution = Execution {
            id: ExecutionId::from("exec-1"),
            name: "demo".to_string(),
            started_at: started,
            ended_at: None,
            metadata: Map::new(),
            steps: vec![Step {
                id: 1,
                name: "screen".to_string(),
                kind: StepKind::Filter,
                input: json!({}),
                rules: Vec::new(),
                evaluations: vec![Evaluation::from_checks(
                    "1",
                    "one",
                    Entity::new(),
                    vec![check(true)],
                )],
                output: json!({}),
                reasoning: "ok".to_string(),
                started_at: started,
                ended_at: started,
            }],
        };
        let value = serde_json::to_value(&execution);
        assert!(value.is_ok());
        let value = value.unwrap_or_else(|_| unreachable!());
        assert_eq!(value["id"], json!("exec-1"));
        assert_eq!(value["started_at"], json!("2025-01-20T10:15:00Z"));
        assert_eq!(value["ended_at"], Value::Null);
        assert_eq!(value["steps"][0]["type"], json!("filter"));
        assert_eq!(
            value["steps"][0]["evaluations"][0]["final_decision"],
            json!("accepted")
        );

        let back: Result<Execution, _> = serde_json::from_value(value);
        assert!(back.is_ok());
        assert_eq!(back.unwrap_or_else(|_| unreachable!()), execution);
    }

    #[test]
    fn execution_reads_legacy_timestamp_shapes() {
        let value = json!({
            "id": "exec-2",
            "name": "legacy",
            "started_at": "2025-01-20 10:15:00",
            "ended_at": "not a time",
        });
        let parsed: Result<Execution, _> = serde_json::from_value(value);
        assert!(parsed.is_ok());
        let parsed = parsed.unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.started_at, utc("2025-01-20T10:15:00Z"));
        assert_eq!(parsed.ended_at, None);
    }

    #[test]
    fn workflow_definition_applies_defaults() {
        let parsed: Result<WorkflowDefinition, _> =
            serde_json::from_value(json!({"steps": [{"input_fields": ["rating"]}]}));
        assert!(parsed.is_ok());
        let parsed = parsed.unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.workflow_id, "generic_workflow");
        assert_eq!(parsed.steps[0].step_type, "filter");
    }

    #[test]
    fn hash_json_is_stable() {
        let first = hash_json(&json!({"a": 1, "b": [1, 2]}));
        let second = hash_json(&json!({"a": 1, "b": [1, 2]}));
        assert!(first.is_ok());
        assert_eq!(first.ok(), second.ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn accepted_iff_every_check_passes(outcomes in proptest::collection::vec(any::<bool>(), 0..12)) {
            let checks: Vec<Check> = outcomes.iter().map(|passed| check(*passed)).collect();
            let evaluation = Evaluation::from_checks("e", "e", Entity::new(), checks);
            prop_assert_eq!(evaluation.is_accepted(), outcomes.iter().all(|passed| *passed));
            prop_assert_eq!(evaluation.filters_total, outcomes.len());
            prop_assert_eq!(
                evaluation.filters_passed,
                outcomes.iter().filter(|passed| **passed).count()
            );
        }
    }
}
