#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use decision_trace_domain::{
    format_timestamp, normalize_timestamp, normalize_timestamp_value, now_utc, AppliedRule,
    DateTimeUtc, Evaluation, Execution, ExecutionId, ExecutionSummary, Step, StepKind,
    WorkflowDefinition, WorkflowSummary, RESERVED_METADATA_KEYS, UNNAMED_EXECUTION,
};
use decision_trace_reasoning::step_reasoning;
use serde_json::{Map, Value};
use time::macros::format_description;
use time::UtcOffset;
use tracing::{debug, info, warn};

pub trait TraceStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn save_execution(
        &self,
        execution_id: &ExecutionId,
        metadata: &Map<String, Value>,
        steps: &[Step],
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionSummary>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_execution(&self, execution_id: &ExecutionId) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_workflow(&self, workflow_id: &str) -> Result<()>;
}

/// Dedicated columns a backend may keep next to the metadata blob. Any of them
/// may be missing for records written by older producers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionHeader {
    pub name: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub created_at: String,
}

impl ExecutionHeader {
    /// Header values a writer derives from recorder metadata.
    #[must_use]
    pub fn from_metadata(metadata: &Map<String, Value>, created_at: String) -> Self {
        Self {
            name: metadata_text(metadata, "name"),
            started_at: metadata_text(metadata, "started_at"),
            ended_at: metadata_text(metadata, "ended_at")
                .or_else(|| metadata_text(metadata, "completed_at")),
            created_at,
        }
    }
}

fn metadata_text(metadata: &Map<String, Value>, key: &str) -> Option<String> {
    match metadata.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

/// Fixed-width UTC rendering whose text order matches time order.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn sortable_timestamp(value: DateTimeUtc) -> Result<String> {
    Ok(value.to_offset(UtcOffset::UTC).format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    ))?)
}

/// The `created_at` a writer stores: the normalized `started_at` from metadata,
/// or the write time when the producer never stamped one.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn creation_timestamp(metadata: &Map<String, Value>) -> Result<String> {
    let started = metadata
        .get("started_at")
        .and_then(normalize_timestamp_value)
        .unwrap_or_else(now_utc);
    sortable_timestamp(started)
}

/// Resolve the execution name: dedicated column, then `name`, then `workflow`,
/// then `workflow_name` in metadata.
#[must_use]
pub fn execution_name(header: &ExecutionHeader, metadata: &Map<String, Value>) -> String {
    header
        .name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| metadata_text(metadata, "name"))
        .or_else(|| metadata_text(metadata, "workflow"))
        .or_else(|| metadata_text(metadata, "workflow_name"))
        .unwrap_or_else(|| UNNAMED_EXECUTION.to_string())
}

/// # Errors
/// Returns an error when no candidate timestamp can be parsed.
pub fn execution_started_at(
    execution_id: &ExecutionId,
    header: &ExecutionHeader,
    metadata: &Map<String, Value>,
) -> Result<DateTimeUtc> {
    header
        .started_at
        .as_deref()
        .and_then(normalize_timestamp)
        .or_else(|| metadata.get("started_at").and_then(normalize_timestamp_value))
        .or_else(|| normalize_timestamp(&header.created_at))
        .ok_or_else(|| anyhow!("execution {execution_id} has no readable start timestamp"))
}

/// Resolve `ended_at`: dedicated column, metadata `ended_at`/`completed_at`,
/// then the end of the last recorded step.
#[must_use]
pub fn execution_ended_at(
    header: &ExecutionHeader,
    metadata: &Map<String, Value>,
    last_step_end: Option<DateTimeUtc>,
) -> Option<DateTimeUtc> {
    header
        .ended_at
        .as_deref()
        .and_then(normalize_timestamp)
        .or_else(|| metadata.get("ended_at").and_then(normalize_timestamp_value))
        .or_else(|| metadata.get("completed_at").and_then(normalize_timestamp_value))
        .or(last_step_end)
}

/// Metadata without the keys lifted into dedicated canonical fields.
#[must_use]
pub fn canonical_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(key, _)| !RESERVED_METADATA_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Rebuild the canonical Execution from stored pieces.
///
/// # Errors
/// Returns an error when the start timestamp cannot be recovered.
pub fn assemble_execution(
    execution_id: &ExecutionId,
    header: &ExecutionHeader,
    metadata: &Map<String, Value>,
    steps: Vec<Step>,
) -> Result<Execution> {
    Ok(Execution {
        id: execution_id.clone(),
        name: execution_name(header, metadata),
        started_at: execution_started_at(execution_id, header, metadata)?,
        ended_at: execution_ended_at(header, metadata, steps.last().map(|step| step.ended_at)),
        metadata: canonical_metadata(metadata),
        steps,
    })
}

/// Summary counterpart of [`assemble_execution`]. `last_step_end` is the end of
/// the final step, so both read paths resolve the same `ended_at`.
///
/// # Errors
/// Returns an error when the start timestamp cannot be recovered.
pub fn assemble_summary(
    execution_id: &ExecutionId,
    header: &ExecutionHeader,
    metadata: &Map<String, Value>,
    steps_count: usize,
    last_step_end: Option<DateTimeUtc>,
) -> Result<ExecutionSummary> {
    Ok(ExecutionSummary {
        id: execution_id.clone(),
        name: execution_name(header, metadata),
        started_at: execution_started_at(execution_id, header, metadata)?,
        ended_at: execution_ended_at(header, metadata, last_step_end),
        metadata: canonical_metadata(metadata),
        steps_count,
    })
}

#[derive(Debug, Clone)]
struct StoredExecution {
    sequence: u64,
    header: ExecutionHeader,
    metadata: Map<String, Value>,
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
struct StoredWorkflow {
    definition: WorkflowDefinition,
    updated_at: DateTimeUtc,
    sequence: u64,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_sequence: u64,
    executions: BTreeMap<ExecutionId, StoredExecution>,
    workflows: BTreeMap<String, StoredWorkflow>,
}

impl InMemoryState {
    fn bump(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

/// Process-local store with the same canonical read shape as the relational one.
#[derive(Debug, Default)]
pub struct InMemoryTraceStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryTraceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory trace store lock poisoned"))
    }
}

impl TraceStore for InMemoryTraceStore {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn save_execution(
        &self,
        execution_id: &ExecutionId,
        metadata: &Map<String, Value>,
        steps: &[Step],
    ) -> Result<()> {
        let mut state = self.lock()?;
        let (sequence, created_at) = match state.executions.get(execution_id) {
            Some(existing) => (existing.sequence, existing.header.created_at.clone()),
            None => (state.bump(), creation_timestamp(metadata)?),
        };
        state.executions.insert(
            execution_id.clone(),
            StoredExecution {
                sequence,
                header: ExecutionHeader::from_metadata(metadata, created_at),
                metadata: metadata.clone(),
                steps: steps.to_vec(),
            },
        );
        Ok(())
    }

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>> {
        let state = self.lock()?;
        state
            .executions
            .get(execution_id)
            .map(|stored| {
                assemble_execution(
                    execution_id,
                    &stored.header,
                    &stored.metadata,
                    stored.steps.clone(),
                )
            })
            .transpose()
    }

    fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let state = self.lock()?;
        let mut stored: Vec<(&ExecutionId, &StoredExecution)> = state.executions.iter().collect();
        stored.sort_by(|lhs, rhs| {
            rhs.1
                .header
                .created_at
                .cmp(&lhs.1.header.created_at)
                .then(rhs.1.sequence.cmp(&lhs.1.sequence))
        });
        stored
            .into_iter()
            .take(limit)
            .map(|(id, stored)| {
                assemble_summary(
                    id,
                    &stored.header,
                    &stored.metadata,
                    stored.steps.len(),
                    stored.steps.last().map(|step| step.ended_at),
                )
            })
            .collect()
    }

    fn delete_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        self.lock()?.executions.remove(execution_id);
        Ok(())
    }

    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let mut state = self.lock()?;
        let sequence = state.bump();
        state.workflows.insert(
            workflow.workflow_id.clone(),
            StoredWorkflow {
                definition: workflow.clone(),
                updated_at: now_utc(),
                sequence,
            },
        );
        Ok(())
    }

    fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self
            .lock()?
            .workflows
            .get(workflow_id)
            .map(|stored| stored.definition.clone()))
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let state = self.lock()?;
        let mut stored: Vec<&StoredWorkflow> = state.workflows.values().collect();
        stored.sort_by_key(|stored| Reverse(stored.sequence));
        Ok(stored
            .into_iter()
            .map(|stored| WorkflowSummary {
                workflow_id: stored.definition.workflow_id.clone(),
                name: stored.definition.name.clone(),
                steps_count: stored.definition.steps.len(),
                updated_at: stored.updated_at,
            })
            .collect())
    }

    fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.lock()?.workflows.remove(workflow_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderConfig {
    pub auto_persist: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { auto_persist: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Active,
    Sealed,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RecorderError {
    #[error("trace context is not active; record steps between open() and close()")]
    InactiveContext,
    #[error("trace context was already opened")]
    AlreadyOpened,
    #[error("execution {0} is sealed and can no longer be modified")]
    Sealed(ExecutionId),
    #[error("no step matches {0}")]
    UnknownStep(StepRef),
    #[error("no trace store configured for execution {0}")]
    NoStore(ExecutionId),
}

/// Addresses a recorded step by its id or by its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRef {
    Id(u64),
    Index(usize),
}

impl std::fmt::Display for StepRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "step id {id}"),
            Self::Index(index) => write!(f, "step index {index}"),
        }
    }
}

/// Everything a caller supplies for a new step; ids and timestamps are assigned
/// by the recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDraft {
    pub name: String,
    pub kind: StepKind,
    pub input: Value,
    pub rules: Vec<AppliedRule>,
    pub evaluations: Vec<Evaluation>,
    pub output: Value,
    pub reasoning: String,
}

impl StepDraft {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            input: Value::Object(Map::new()),
            rules: Vec::new(),
            evaluations: Vec::new(),
            output: Value::Object(Map::new()),
            reasoning: String::new(),
        }
    }

    #[must_use]
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn rules(mut self, rules: Vec<AppliedRule>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn evaluations(mut self, evaluations: Vec<Evaluation>) -> Self {
        self.evaluations = evaluations;
        self
    }

    #[must_use]
    pub fn output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepPatch {
    pub name: Option<String>,
    pub input: Option<Value>,
    pub rules: Option<Vec<AppliedRule>>,
    pub evaluations: Option<Vec<Evaluation>>,
    pub output: Option<Value>,
    pub reasoning: Option<String>,
}

/// Builds one Execution: `Idle -> Active -> Sealed`. Steps can only be recorded
/// while active and nothing can change after the seal.
pub struct TraceRecorder<'s> {
    execution: Execution,
    state: RecorderState,
    store: Option<&'s dyn TraceStore>,
    config: RecorderConfig,
    next_step_id: u64,
    persisted: bool,
}

impl<'s> TraceRecorder<'s> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(ExecutionId::new(), name)
    }

    #[must_use]
    pub fn with_id(execution_id: ExecutionId, name: impl Into<String>) -> Self {
        Self {
            execution: Execution {
                id: execution_id,
                name: name.into(),
                started_at: now_utc(),
                ended_at: None,
                metadata: Map::new(),
                steps: Vec::new(),
            },
            state: RecorderState::Idle,
            store: None,
            config: RecorderConfig::default(),
            next_step_id: 1,
            persisted: false,
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: &'s dyn TraceStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RecorderConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn id(&self) -> &ExecutionId {
        &self.execution.id
    }

    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == RecorderState::Active
    }

    /// View of the execution built so far.
    #[must_use]
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.execution.steps
    }

    /// # Errors
    /// Returns an error when the recorder was opened before.
    pub fn open(&mut self) -> Result<(), RecorderError> {
        if self.state != RecorderState::Idle {
            return Err(RecorderError::AlreadyOpened);
        }
        let started_at = now_utc();
        self.execution.started_at = started_at;
        self.state = RecorderState::Active;
        let metadata = &mut self.execution.metadata;
        metadata.insert("execution_id".to_string(), Value::from(self.execution.id.as_str()));
        metadata.insert("name".to_string(), Value::from(self.execution.name.as_str()));
        if let Ok(text) = format_timestamp(started_at) {
            metadata.insert("started_at".to_string(), Value::String(text));
        }
        debug!(execution_id = %self.execution.id, "trace opened");
        Ok(())
    }

    /// Append a step with the next id and the current time. A draft without
    /// reasoning gets the generic summary of its input and output.
    ///
    /// # Errors
    /// Returns [`RecorderError::InactiveContext`] unless the recorder is active.
    pub fn record_step(&mut self, draft: StepDraft) -> Result<&Step, RecorderError> {
        if self.state != RecorderState::Active {
            return Err(RecorderError::InactiveContext);
        }
        let now = now_utc();
        let reasoning = if draft.reasoning.trim().is_empty() {
            step_reasoning(&draft.name, &draft.input, &draft.output)
        } else {
            draft.reasoning
        };
        let step = Step {
            id: self.next_step_id,
            name: draft.name,
            kind: draft.kind,
            input: draft.input,
            rules: draft.rules,
            evaluations: draft.evaluations,
            output: draft.output,
            reasoning,
            started_at: now,
            ended_at: now,
        };
        self.next_step_id += 1;
        debug!(
            execution_id = %self.execution.id,
            step_id = step.id,
            step = %step.name,
            kind = step.kind.as_str(),
            evaluations = step.evaluations.len(),
            "step recorded"
        );
        self.execution.steps.push(step);
        Ok(&self.execution.steps[self.execution.steps.len() - 1])
    }

    /// # Errors
    /// Returns [`RecorderError::Sealed`] after the execution was sealed.
    pub fn add_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), RecorderError> {
        if self.state == RecorderState::Sealed {
            return Err(RecorderError::Sealed(self.execution.id.clone()));
        }
        self.execution.metadata.insert(key.into(), value.into());
        Ok(())
    }

    /// Patch a recorded step and refresh its end timestamp.
    ///
    /// # Errors
    /// Returns an error after the seal or when `target` matches no step.
    pub fn update_step(&mut self, target: StepRef, patch: StepPatch) -> Result<&Step, RecorderError> {
        if self.state == RecorderState::Sealed {
            return Err(RecorderError::Sealed(self.execution.id.clone()));
        }
        let position = match target {
            StepRef::Id(id) => self.execution.steps.iter().position(|step| step.id == id),
            StepRef::Index(index) => (index < self.execution.steps.len()).then_some(index),
        }
        .ok_or(RecorderError::UnknownStep(target))?;

        let step = &mut self.execution.steps[position];
        if let Some(name) = patch.name {
            step.name = name;
        }
        if let Some(input) = patch.input {
            step.input = input;
        }
        if let Some(rules) = patch.rules {
            step.rules = rules;
        }
        if let Some(evaluations) = patch.evaluations {
            step.evaluations = evaluations;
        }
        if let Some(output) = patch.output {
            step.output = output;
        }
        if let Some(reasoning) = patch.reasoning {
            step.reasoning = reasoning;
        }
        step.ended_at = now_utc();
        Ok(&self.execution.steps[position])
    }

    /// Seal the execution and, with auto-persist on, flush it once. Closing an
    /// already sealed recorder does nothing.
    ///
    /// # Errors
    /// Returns [`RecorderError::InactiveContext`] when the recorder was never
    /// opened, or the flush error. The execution stays sealed after a failed flush.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            RecorderState::Idle => return Err(RecorderError::InactiveContext.into()),
            RecorderState::Sealed => return Ok(()),
            RecorderState::Active => {}
        }
        let ended_at = now_utc();
        self.execution.ended_at = Some(ended_at);
        let total_steps = self.execution.steps.len();
        let metadata = &mut self.execution.metadata;
        if let Ok(text) = format_timestamp(ended_at) {
            metadata.insert("ended_at".to_string(), Value::String(text));
        }
        metadata.insert("total_steps".to_string(), Value::from(total_steps));
        self.state = RecorderState::Sealed;
        info!(
            execution_id = %self.execution.id,
            steps = total_steps,
            "execution sealed"
        );

        if self.config.auto_persist && self.store.is_some() && !self.persisted {
            self.save()?;
        }
        Ok(())
    }

    /// Flush the current state of the execution to the configured store.
    ///
    /// # Errors
    /// Returns an error when no store is configured or the store write fails.
    pub fn save(&mut self) -> Result<()> {
        let Some(store) = self.store else {
            return Err(RecorderError::NoStore(self.execution.id.clone()).into());
        };
        store.save_execution(
            &self.execution.id,
            &self.execution.metadata,
            &self.execution.steps,
        )?;
        self.persisted = self.state == RecorderState::Sealed;
        info!(execution_id = %self.execution.id, steps = self.execution.steps.len(), "execution persisted");
        Ok(())
    }

    #[must_use]
    pub fn into_execution(self) -> Execution {
        self.execution
    }

    /// Run `body` inside an opened trace and seal it on every exit path. The
    /// body's error wins over a failed flush; the flush error is logged.
    ///
    /// # Errors
    /// Returns the body's error, or the flush error when the body succeeded.
    pub fn scope<T, F>(
        name: impl Into<String>,
        store: Option<&'s dyn TraceStore>,
        config: RecorderConfig,
        body: F,
    ) -> Result<(T, Execution)>
    where
        F: FnOnce(&mut TraceRecorder<'s>) -> Result<T>,
    {
        let mut recorder = TraceRecorder::new(name).with_config(config);
        recorder.store = store;
        recorder.open()?;

        let outcome = body(&mut recorder);
        let sealed = recorder.close();
        match (outcome, sealed) {
            (Ok(value), Ok(())) => Ok((value, recorder.into_execution())),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(flush)) => {
                warn!(execution_id = %recorder.id(), error = %flush, "flush failed after step error");
                Err(err)
            }
        }
    }
}
