#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use decision_trace_domain::{
    format_timestamp, hash_json, normalize_timestamp, now_utc, AppliedRule, DateTimeUtc,
    Evaluation, Execution, ExecutionId, ExecutionSummary, Step, StepKind, WorkflowDefinition,
    WorkflowSummary,
};
use decision_trace_trace_core::{
    assemble_execution, assemble_summary, creation_timestamp, execution_started_at,
    sortable_timestamp, ExecutionHeader, TraceStore,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::{debug, info};

const TRACE_SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
  execution_id TEXT PRIMARY KEY,
  name TEXT,
  started_at TEXT,
  ended_at TEXT,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT
);

CREATE TABLE IF NOT EXISTS execution_steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  execution_id TEXT NOT NULL,
  step_order INTEGER NOT NULL,
  step_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  step_type TEXT NOT NULL CHECK (step_type IN ('filter','ranking','transformation','general')),
  input_json TEXT NOT NULL DEFAULT '{}',
  rules_json TEXT NOT NULL DEFAULT '[]',
  evaluations_json TEXT NOT NULL DEFAULT '[]',
  output_json TEXT NOT NULL DEFAULT '{}',
  reasoning TEXT NOT NULL DEFAULT '',
  started_at TEXT,
  ended_at TEXT,
  UNIQUE(execution_id, step_order),
  FOREIGN KEY (execution_id) REFERENCES executions(execution_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS workflows (
  workflow_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  workflow_json TEXT NOT NULL,
  workflow_hash TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_execution_steps_order ON execution_steps(execution_id, step_order);
CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);
CREATE INDEX IF NOT EXISTS idx_workflows_updated ON workflows(updated_at);
";

/// Relational trace store. Each step is its own row, ordered by `step_order`.
pub struct SqliteTraceStore {
    conn: Connection,
}

impl SqliteTraceStore {
    /// Open or create a `SQLite` trace database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply trace schema")?;

        ensure_column(&self.conn, "executions", "updated_at", "TEXT")?;
        ensure_column(&self.conn, "workflows", "workflow_hash", "TEXT")?;

        let now = format_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACE_SCHEMA_VERSION, now],
            )
            .context("failed to record trace migration")?;

        Ok(())
    }

    fn save_execution(
        &self,
        execution_id: &ExecutionId,
        metadata: &Map<String, Value>,
        steps: &[Step],
    ) -> Result<()> {
        let header = ExecutionHeader::from_metadata(metadata, creation_timestamp(metadata)?);
        let started_at = header
            .started_at
            .as_deref()
            .and_then(normalize_timestamp)
            .map(format_timestamp)
            .transpose()?;
        let ended_at = header
            .ended_at
            .as_deref()
            .and_then(normalize_timestamp)
            .map(format_timestamp)
            .transpose()?;
        let updated_at = sortable_timestamp(now_utc())?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start execution transaction")?;

        tx.execute(
            "INSERT INTO executions(
                execution_id, name, started_at, ended_at, metadata_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(execution_id) DO UPDATE SET
                name = excluded.name,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at",
            params![
                execution_id.as_str(),
                header.name,
                started_at,
                ended_at,
                serde_json::to_string(metadata)?,
                header.created_at,
                updated_at,
            ],
        )
        .context("failed to upsert execution")?;

        tx.execute(
            "DELETE FROM execution_steps WHERE execution_id = ?1",
            params![execution_id.as_str()],
        )
        .context("failed to clear execution steps")?;

        for (order, step) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO execution_steps(
                    execution_id, step_order, step_id, name, step_type, input_json,
                    rules_json, evaluations_json, output_json, reasoning, started_at, ended_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    execution_id.as_str(),
                    i64::try_from(order)?,
                    i64::try_from(step.id)?,
                    step.name,
                    step.kind.as_str(),
                    serde_json::to_string(&step.input)?,
                    serde_json::to_string(&step.rules)?,
                    serde_json::to_string(&step.evaluations)?,
                    serde_json::to_string(&step.output)?,
                    step.reasoning,
                    format_timestamp(step.started_at)?,
                    format_timestamp(step.ended_at)?,
                ],
            )
            .with_context(|| format!("failed to insert step {} of {execution_id}", step.id))?;
        }

        tx.commit().context("failed to commit execution transaction")?;
        debug!(execution_id = %execution_id, steps = steps.len(), "execution rows written");
        Ok(())
    }

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>> {
        // Header and steps must come from the same committed snapshot.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start execution read")?;
        let Some((header, metadata)) = read_header(&tx, execution_id)? else {
            return Ok(None);
        };
        let started_at = execution_started_at(execution_id, &header, &metadata)?;
        let steps = read_steps(&tx, execution_id, started_at)?;
        tx.commit().context("failed to finish execution read")?;
        assemble_execution(execution_id, &header, &metadata, steps).map(Some)
    }

    fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start execution listing")?;
        let mut out = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT
                    e.execution_id, e.name, e.started_at, e.ended_at, e.metadata_json, e.created_at,
                    (SELECT COUNT(*) FROM execution_steps s WHERE s.execution_id = e.execution_id),
                    last.started_at, last.ended_at
                 FROM executions e
                 LEFT JOIN execution_steps last
                   ON last.execution_id = e.execution_id
                  AND last.step_order = (
                      SELECT MAX(s.step_order) FROM execution_steps s
                      WHERE s.execution_id = e.execution_id
                  )
                 ORDER BY e.created_at DESC, e.execution_id ASC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
            while let Some(row) = rows.next()? {
                let execution_id = ExecutionId::from(row.get::<_, String>(0)?);
                let header = ExecutionHeader {
                    name: row.get(1)?,
                    started_at: row.get(2)?,
                    ended_at: row.get(3)?,
                    created_at: row.get(5)?,
                };
                let metadata = parse_metadata(&execution_id, &row.get::<_, String>(4)?)?;
                let steps_count = usize::try_from(row.get::<_, i64>(6)?)?;
                let last_step_end = if steps_count == 0 {
                    None
                } else {
                    let started_at = execution_started_at(&execution_id, &header, &metadata)?;
                    Some(step_window(row.get(7)?, row.get(8)?, started_at).1)
                };
                out.push(assemble_summary(
                    &execution_id,
                    &header,
                    &metadata,
                    steps_count,
                    last_step_end,
                )?);
            }
        }
        tx.commit().context("failed to finish execution listing")?;
        Ok(out)
    }

    fn delete_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start delete transaction")?;
        tx.execute(
            "DELETE FROM execution_steps WHERE execution_id = ?1",
            params![execution_id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM executions WHERE execution_id = ?1",
            params![execution_id.as_str()],
        )?;
        tx.commit().context("failed to commit delete transaction")?;
        Ok(())
    }

    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let workflow_json = serde_json::to_value(workflow)?;
        let now = sortable_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO workflows(
                    workflow_id, name, workflow_json, workflow_hash, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(workflow_id) DO UPDATE SET
                    name = excluded.name,
                    workflow_json = excluded.workflow_json,
                    workflow_hash = excluded.workflow_hash,
                    updated_at = excluded.updated_at",
                params![
                    workflow.workflow_id,
                    workflow.name,
                    serde_json::to_string(&workflow_json)?,
                    hash_json(&workflow_json)?,
                    now,
                ],
            )
            .context("failed to upsert workflow")?;
        info!(workflow_id = %workflow.workflow_id, steps = workflow.steps.len(), "workflow saved");
        Ok(())
    }

    fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT workflow_json FROM workflows WHERE workflow_id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("invalid workflow_json for {workflow_id}"))
        })
        .transpose()
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, name, workflow_json, updated_at
             FROM workflows
             ORDER BY updated_at DESC, workflow_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let workflow_id: String = row.get(0)?;
            let definition: WorkflowDefinition = serde_json::from_str(&row.get::<_, String>(2)?)
                .with_context(|| format!("invalid workflow_json for {workflow_id}"))?;
            let updated_raw: String = row.get(3)?;
            let updated_at = normalize_timestamp(&updated_raw)
                .ok_or_else(|| anyhow!("workflow {workflow_id} has unreadable updated_at"))?;
            out.push(WorkflowSummary {
                workflow_id,
                name: row.get(1)?,
                steps_count: definition.steps.len(),
                updated_at,
            });
        }
        Ok(out)
    }

    fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM workflows WHERE workflow_id = ?1",
                params![workflow_id],
            )
            .context("failed to delete workflow")?;
        Ok(())
    }
}

fn read_header(
    conn: &Connection,
    execution_id: &ExecutionId,
) -> Result<Option<(ExecutionHeader, Map<String, Value>)>> {
    let found = conn
        .query_row(
            "SELECT name, started_at, ended_at, metadata_json, created_at
             FROM executions WHERE execution_id = ?1",
            params![execution_id.as_str()],
            |row| {
                Ok((
                    ExecutionHeader {
                        name: row.get(0)?,
                        started_at: row.get(1)?,
                        ended_at: row.get(2)?,
                        created_at: row.get(4)?,
                    },
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    match found {
        Some((header, metadata_json)) => {
            let metadata = parse_metadata(execution_id, &metadata_json)?;
            Ok(Some((header, metadata)))
        }
        None => Ok(None),
    }
}

fn read_steps(
    conn: &Connection,
    execution_id: &ExecutionId,
    fallback_start: DateTimeUtc,
) -> Result<Vec<Step>> {
    let mut stmt = conn.prepare(
        "SELECT
            step_id, name, step_type, input_json, rules_json,
            evaluations_json, output_json, reasoning, started_at, ended_at
         FROM execution_steps
         WHERE execution_id = ?1
         ORDER BY step_order ASC",
    )?;

    let mut rows = stmt.query(params![execution_id.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(step_from_row(row, fallback_start)?);
    }
    Ok(out)
}

/// A step's `(started_at, ended_at)`: unreadable starts fall back to the
/// execution start, unreadable ends to the step start.
fn step_window(
    started_raw: Option<String>,
    ended_raw: Option<String>,
    fallback_start: DateTimeUtc,
) -> (DateTimeUtc, DateTimeUtc) {
    let started_at = started_raw
        .as_deref()
        .and_then(normalize_timestamp)
        .unwrap_or(fallback_start);
    let ended_at = ended_raw
        .as_deref()
        .and_then(normalize_timestamp)
        .unwrap_or(started_at);
    (started_at, ended_at)
}

fn step_from_row(row: &Row<'_>, fallback_start: DateTimeUtc) -> Result<Step> {
    let name: String = row.get(1)?;
    let step_type: String = row.get(2)?;
    let (started_at, ended_at) = step_window(row.get(8)?, row.get(9)?, fallback_start);

    Ok(Step {
        id: u64::try_from(row.get::<_, i64>(0)?)?,
        kind: StepKind::parse(&step_type).unwrap_or(StepKind::General),
        input: parse_json_column(&row.get::<_, String>(3)?, "input_json", &name)?,
        rules: serde_json::from_str::<Vec<AppliedRule>>(&row.get::<_, String>(4)?)
            .with_context(|| format!("invalid rules_json for step {name}"))?,
        evaluations: serde_json::from_str::<Vec<Evaluation>>(&row.get::<_, String>(5)?)
            .with_context(|| format!("invalid evaluations_json for step {name}"))?,
        output: parse_json_column(&row.get::<_, String>(6)?, "output_json", &name)?,
        reasoning: row.get(7)?,
        started_at,
        ended_at,
        name,
    })
}

fn parse_json_column(raw: &str, column: &str, step: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid {column} for step {step}"))
}

fn parse_metadata(execution_id: &ExecutionId, raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw)
        .with_context(|| format!("invalid metadata_json for {execution_id}"))?
    {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(anyhow!(
            "metadata_json for {execution_id} must be an object, got {other}"
        )),
    }
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::SqliteTraceStore;
    use decision_trace_domain::{
        normalize_timestamp, now_utc, AppliedRule, Check, Entity, Evaluation, ExecutionId, Step,
        StepKind, StepSpec, WorkflowDefinition,
    };
    use decision_trace_trace_core::TraceStore;
    use rusqlite::params;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "decision-trace-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn migrated_store(name: &str) -> SqliteTraceStore {
        let store = SqliteTraceStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_step(id: u64, name: &str, kind: StepKind) -> Step {
        let now = now_utc();
        let evaluation = Evaluation::from_checks(
            "1",
            "Widget",
            Entity::new().with("score", 5_i64),
            vec![Check {
                rule: "min_score".to_string(),
                passed: true,
                expected: "score >= 3".to_string(),
                actual: "score = 5".to_string(),
                reason: "Value 5 meets minimum 3".to_string(),
            }],
        );
        Step {
            id,
            name: name.to_string(),
            kind,
            input: json!({"candidates_count": 1}),
            rules: vec![AppliedRule {
                name: "min_score".to_string(),
                kind: "filter".to_string(),
                definition: json!({"field": "score", "rule_type": "min", "value": 3}),
                source: "rules.csv".to_string(),
            }],
            evaluations: vec![evaluation],
            output: json!({"passed": 1, "failed": 0}),
            reasoning: format!("{name} reasoning"),
            started_at: now,
            ended_at: now,
        }
    }

    fn metadata(name: &str, started_at: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), json!(name));
        metadata.insert("started_at".to_string(), json!(started_at));
        metadata.insert("dataset_size".to_string(), json!(1));
        metadata
    }

    #[test]
    fn migrate_is_idempotent_and_records_version() {
        let store = migrated_store("migrate");
        assert!(store.migrate().is_ok());

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(count, 1);
    }

    #[test]
    fn migrate_adds_columns_missing_from_older_databases() {
        let store = SqliteTraceStore::open_in_memory().unwrap_or_else(|_| unreachable!());
        let created = store.conn.execute_batch(
            "CREATE TABLE executions (
               execution_id TEXT PRIMARY KEY,
               name TEXT,
               started_at TEXT,
               ended_at TEXT,
               metadata_json TEXT NOT NULL DEFAULT '{}',
               created_at TEXT NOT NULL
             );",
        );
        assert!(created.is_ok());
        assert!(store.migrate().is_ok());
        let has_updated_at = super::table_has_column(&store.conn, "executions", "updated_at");
        assert!(matches!(has_updated_at, Ok(true)));
    }

    #[test]
    fn round_trip_preserves_step_order_and_content() {
        let store = migrated_store("round-trip");
        let execution_id = ExecutionId::new();
        let steps = vec![
            fixture_step(1, "apply_filters", StepKind::Filter),
            fixture_step(2, "rank_candidates", StepKind::Ranking),
            fixture_step(3, "summarize", StepKind::General),
        ];
        let saved = store.save_execution(
            &execution_id,
            &metadata("pipeline", "2025-01-20T10:15:00+02:00"),
            &steps,
        );
        assert!(saved.is_ok(), "{saved:?}");

        let loaded = store
            .get_execution(&execution_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.name, "pipeline");
        assert_eq!(
            Some(loaded.started_at),
            normalize_timestamp("2025-01-20T08:15:00Z")
        );
        assert_eq!(loaded.steps.len(), 3);
        for (stored, original) in loaded.steps.iter().zip(&steps) {
            assert_eq!(stored.id, original.id);
            assert_eq!(stored.name, original.name);
            assert_eq!(stored.kind, original.kind);
            assert_eq!(stored.rules, original.rules);
            assert_eq!(stored.evaluations, original.evaluations);
            assert_eq!(stored.output, original.output);
            assert_eq!(stored.reasoning, original.reasoning);
            assert_eq!(stored.started_at, original.started_at);
        }
        assert!(loaded.metadata.get("name").is_none());
        assert_eq!(loaded.metadata["dataset_size"], json!(1));
        assert_eq!(loaded.ended_at, Some(steps[2].ended_at));
    }

    #[test]
    fn resave_replaces_steps() {
        let store = migrated_store("resave");
        let execution_id = ExecutionId::new();
        let meta = metadata("pipeline", "2025-01-20T10:15:00Z");
        let first = vec![
            fixture_step(1, "a", StepKind::Filter),
            fixture_step(2, "b", StepKind::Filter),
        ];
        assert!(store.save_execution(&execution_id, &meta, &first).is_ok());
        let second = vec![fixture_step(1, "only", StepKind::Transformation)];
        assert!(store.save_execution(&execution_id, &meta, &second).is_ok());

        let loaded = store
            .get_execution(&execution_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].name, "only");

        let listed = store.list_executions(10).unwrap_or_else(|_| unreachable!());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].steps_count, 1);
    }

    #[test]
    fn legacy_rows_read_back_in_canonical_form() {
        let store = migrated_store("legacy");
        let inserted = store.conn.execute(
            "INSERT INTO executions(execution_id, name, started_at, ended_at, metadata_json, created_at)
             VALUES (?1, NULL, NULL, NULL, ?2, ?3)",
            params![
                "legacy-1",
                r#"{"workflow": "legacy_flow", "started_at": "2025-01-20 10:15:00.250000", "completed_at": "2025-01-20T10:15:04"}"#,
                "2025-01-20 10:15:00"
            ],
        );
        assert!(inserted.is_ok());
        let step = store.conn.execute(
            "INSERT INTO execution_steps(execution_id, step_order, step_id, name, step_type, started_at)
             VALUES ('legacy-1', 0, 1, 'old_step', 'filter', '1737368100')",
            [],
        );
        assert!(step.is_ok());

        let execution_id = ExecutionId::from("legacy-1");
        let loaded = store
            .get_execution(&execution_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.name, "legacy_flow");
        assert_eq!(
            Some(loaded.started_at),
            normalize_timestamp("2025-01-20T10:15:00.25Z")
        );
        assert_eq!(loaded.ended_at, normalize_timestamp("2025-01-20T10:15:04Z"));
        assert_eq!(
            Some(loaded.steps[0].started_at),
            normalize_timestamp("2025-01-20T10:15:00Z")
        );
        assert_eq!(loaded.steps[0].ended_at, loaded.steps[0].started_at);
        assert!(loaded.steps[0].evaluations.is_empty());
        assert_eq!(loaded.metadata["workflow"], json!("legacy_flow"));
        assert!(loaded.metadata.get("completed_at").is_none());

        let canonical = serde_json::to_value(&loaded).unwrap_or_else(|_| unreachable!());
        assert_eq!(canonical["started_at"], json!("2025-01-20T10:15:00.25Z"));
        assert_eq!(canonical["steps"][0]["type"], json!("filter"));
    }

    #[test]
    fn listing_resolves_ended_at_like_get() {
        let store = migrated_store("legacy-open-ended");
        let inserted = store.conn.execute(
            "INSERT INTO executions(execution_id, name, metadata_json, created_at)
             VALUES ('open-ended', 'batch', '{}', '2025-01-20T10:15:00')",
            [],
        );
        assert!(inserted.is_ok());
        let steps = store.conn.execute_batch(
            "INSERT INTO execution_steps(execution_id, step_order, step_id, name, step_type, started_at, ended_at)
             VALUES ('open-ended', 0, 1, 'first', 'filter', '2025-01-20T10:15:01Z', '2025-01-20T10:15:02Z');
             INSERT INTO execution_steps(execution_id, step_order, step_id, name, step_type, started_at)
             VALUES ('open-ended', 1, 2, 'second', 'ranking', '2025-01-20T10:15:05Z');",
        );
        assert!(steps.is_ok());

        let loaded = store
            .get_execution(&ExecutionId::from("open-ended"))
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.ended_at, normalize_timestamp("2025-01-20T10:15:05Z"));

        let listed = store.list_executions(5).unwrap_or_else(|_| unreachable!());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].steps_count, 2);
        assert_eq!(listed[0].ended_at, loaded.ended_at);
    }

    #[test]
    fn concurrent_rewrites_are_read_as_whole_snapshots() {
        let path = temp_db_path("snapshot");
        let writer = SqliteTraceStore::open(&path).unwrap_or_else(|_| unreachable!());
        assert!(writer.migrate().is_ok());
        let reader = SqliteTraceStore::open(&path).unwrap_or_else(|_| unreachable!());

        let version = |size: u64| {
            let mut meta = metadata("churn", "2025-01-20T10:15:00Z");
            meta.insert("total_steps".to_string(), json!(size));
            let steps: Vec<Step> = (1..=size)
                .map(|id| fixture_step(id, &format!("step_{id}"), StepKind::Filter))
                .collect();
            (meta, steps)
        };
        let long = version(40);
        let short = version(1);
        let execution_id = ExecutionId::from("churn");
        assert!(writer.save_execution(&execution_id, &short.0, &short.1).is_ok());

        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let (done, execution_id, long, short) = (&done, &execution_id, &long, &short);
            scope.spawn(move || {
                for round in 0..150 {
                    let (meta, steps) = if round % 2 == 0 { long } else { short };
                    assert!(writer.save_execution(execution_id, meta, steps).is_ok());
                }
                done.store(true, Ordering::SeqCst);
            });

            let mut reads = 0_u64;
            while reads == 0 || !done.load(Ordering::SeqCst) {
                let loaded = reader
                    .get_execution(execution_id)
                    .unwrap_or_else(|_| unreachable!())
                    .unwrap_or_else(|| unreachable!());
                assert_eq!(loaded.metadata["total_steps"], json!(loaded.steps.len()));
                let listed = reader.list_executions(1).unwrap_or_else(|_| unreachable!());
                assert_eq!(listed[0].metadata["total_steps"], json!(listed[0].steps_count));
                reads += 1;
            }
        });
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unreadable_start_is_reported_not_invented() {
        let store = migrated_store("unreadable");
        let inserted = store.conn.execute(
            "INSERT INTO executions(execution_id, metadata_json, created_at) VALUES ('bad', '{}', 'yesterday')",
            [],
        );
        assert!(inserted.is_ok());
        assert!(store.get_execution(&ExecutionId::from("bad")).is_err());
        assert!(store
            .get_execution(&ExecutionId::from("missing"))
            .is_ok_and(|found| found.is_none()));
    }

    #[test]
    fn list_is_newest_first_and_delete_cascades() {
        let store = migrated_store("list");
        let older = ExecutionId::from("older");
        let newer = ExecutionId::from("newer");
        assert!(store
            .save_execution(&older, &metadata("older", "2025-01-20T10:15:00Z"), &[])
            .is_ok());
        assert!(store
            .save_execution(
                &newer,
                &metadata("newer", "2025-01-20T10:15:00.5Z"),
                &[fixture_step(1, "a", StepKind::Filter)],
            )
            .is_ok());

        let listed = store.list_executions(10).unwrap_or_else(|_| unreachable!());
        let ids: Vec<&str> = listed.iter().map(|summary| summary.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(listed[0].steps_count, 1);
        assert_eq!(store.list_executions(1).map(|found| found.len()).ok(), Some(1));

        assert!(store.delete_execution(&newer).is_ok());
        assert!(store
            .get_execution(&newer)
            .is_ok_and(|found| found.is_none()));
        let orphans: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM execution_steps WHERE execution_id = 'newer'",
                [],
                |row| row.get(0),
            )
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(orphans, 0);
    }

    #[test]
    fn workflow_crud_round_trips() {
        let store = migrated_store("workflows");
        let workflow = WorkflowDefinition {
            workflow_id: "wf_products".to_string(),
            name: "Product Filtering".to_string(),
            steps: vec![StepSpec {
                id: "step_1".to_string(),
                step_type: "filter".to_string(),
                label: "Filter by Rating".to_string(),
                input_fields: vec!["rating".to_string()],
                rule: json!({"operator": ">=", "value": 4}),
            }],
        };
        assert!(store.save_workflow(&workflow).is_ok());
        assert!(store.save_workflow(&workflow).is_ok());

        let loaded = store.get_workflow("wf_products").unwrap_or_else(|_| unreachable!());
        assert_eq!(loaded.as_ref(), Some(&workflow));

        let listed = store.list_workflows().unwrap_or_else(|_| unreachable!());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].steps_count, 1);
        assert_eq!(listed[0].name, "Product Filtering");

        assert!(store.delete_workflow("wf_products").is_ok());
        assert!(store
            .get_workflow("wf_products")
            .is_ok_and(|found| found.is_none()));
    }
}
