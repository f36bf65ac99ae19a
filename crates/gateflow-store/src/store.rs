use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::gate::GateEvaluation;
use gateflow_core::traits::FlowStore;
use gateflow_core::tree::FlowDefinition;
use gateflow_core::types::*;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flows (
    flow_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    definition TEXT NOT NULL,
    saved_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    flow_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    parent_id TEXT,
    order_index INTEGER NOT NULL,
    config TEXT NOT NULL,
    PRIMARY KEY (flow_id, node_id)
);

CREATE TABLE IF NOT EXISTS rules (
    flow_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    gate_id TEXT NOT NULL,
    name TEXT NOT NULL,
    condition TEXT NOT NULL,
    priority INTEGER NOT NULL,
    weight REAL NOT NULL,
    critical INTEGER NOT NULL,
    PRIMARY KEY (flow_id, rule_id)
);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    flow_id TEXT NOT NULL,
    status TEXT NOT NULL,
    reason TEXT,
    initial_context TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_flow ON executions(flow_id, started_at);

CREATE TABLE IF NOT EXISTS node_executions (
    visit_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL,
    output TEXT NOT NULL,
    error TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_node_executions_exec ON node_executions(execution_id, ended_at);

CREATE TABLE IF NOT EXISTS gate_evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    gate_node_id TEXT NOT NULL,
    aggregate_score REAL NOT NULL,
    decision TEXT NOT NULL,
    reason TEXT NOT NULL,
    rule_results TEXT NOT NULL,
    critical_failures TEXT NOT NULL,
    evaluated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gate_evaluations_exec ON gate_evaluations(execution_id, id);

CREATE TABLE IF NOT EXISTS working_memory (
    execution_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    written_by TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (execution_id, key)
);

CREATE TABLE IF NOT EXISTS episodic_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_id TEXT NOT NULL,
    signature TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT NOT NULL,
    success INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodic_lookup ON episodic_memory(flow_id, signature, id);

CREATE TABLE IF NOT EXISTS agent_assignments (
    assignment_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    assigned_at TEXT NOT NULL,
    completed_at TEXT,
    success INTEGER,
    performance_score REAL
);

CREATE INDEX IF NOT EXISTS idx_assignments_exec ON agent_assignments(execution_id, assigned_at);
CREATE INDEX IF NOT EXISTS idx_assignments_agent ON agent_assignments(agent_id);

CREATE TABLE IF NOT EXISTS audit_log (
    execution_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    node_id TEXT,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (execution_id, sequence)
);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;
";

fn db<E: std::fmt::Display>(e: E) -> GateflowError {
    GateflowError::Database(e.to_string())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| db(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| db(format!("bad JSON column: {}", e)))
}

/// SQLite-backed flow store.
pub struct SqliteFlowStore {
    conn: Mutex<Connection>,
}

impl SqliteFlowStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| db(format!("Failed to create db directory: {}", e)))?;
            }
        }

        let conn = Connection::open(path).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "Flow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db)
    }
}

type ExecutionRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
);

fn execution_from_row(row: ExecutionRow) -> Result<Execution> {
    let (id, flow_id, status, reason, ctx, started, ended) = row;
    Ok(Execution {
        id: ExecutionId(id),
        flow_id,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| db(format!("unknown execution status '{}'", status)))?,
        reason,
        initial_context: parse_json(&ctx)?,
        started_at: parse_ts(&started)?,
        ended_at: ended.as_deref().map(parse_ts).transpose()?,
    })
}

fn read_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

type AssignmentRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<bool>,
    Option<f64>,
);

fn assignment_from_row(row: AssignmentRow) -> Result<AgentAssignment> {
    let (id, execution_id, node_id, agent_id, attempt, assigned, completed, success, score) = row;
    Ok(AgentAssignment {
        id,
        execution_id: ExecutionId(execution_id),
        node_id,
        agent_id,
        attempt: attempt as u32,
        assigned_at: parse_ts(&assigned)?,
        completed_at: completed.as_deref().map(parse_ts).transpose()?,
        success,
        performance_score: score,
    })
}

/// Running totals for one agent while folding assignment rows.
#[derive(Default)]
struct PerformanceTally {
    total: u64,
    successful: u64,
    score_sum: f64,
    scored: u64,
    duration_sum: f64,
    timed: u64,
}

impl PerformanceTally {
    fn add(&mut self, assignment: &AgentAssignment) {
        self.total += 1;
        if assignment.success == Some(true) {
            self.successful += 1;
        }
        if let Some(score) = assignment.performance_score {
            self.score_sum += score;
            self.scored += 1;
        }
        if let Some(done) = assignment.completed_at {
            let millis = (done - assignment.assigned_at).num_milliseconds();
            self.duration_sum += millis as f64 / 1000.0;
            self.timed += 1;
        }
    }

    fn finish(self, agent_id: String) -> AgentPerformance {
        let mean = |sum: f64, n: u64| (n > 0).then(|| sum / n as f64);
        AgentPerformance {
            agent_id,
            total_assignments: self.total,
            successful: self.successful,
            success_rate: if self.total > 0 {
                self.successful as f64 / self.total as f64
            } else {
                0.0
            },
            avg_score: mean(self.score_sum, self.scored),
            avg_duration_secs: mean(self.duration_sum, self.timed),
        }
    }
}

fn read_assignment(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

const ASSIGNMENT_COLUMNS: &str = "assignment_id, execution_id, node_id, agent_id, attempt,
     assigned_at, completed_at, success, performance_score";

impl FlowStore for SqliteFlowStore {
    fn save_flow(&self, flow: &FlowDefinition) -> Result<()> {
        let definition = serde_json::to_string(flow)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        tx.execute(
            "INSERT INTO flows (flow_id, name, description, definition, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(flow_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                definition = excluded.definition,
                saved_at = excluded.saved_at",
            params![flow.flow_id, flow.name, flow.description, definition, ts(&Utc::now())],
        )
        .map_err(db)?;
        tx.execute("DELETE FROM nodes WHERE flow_id = ?1", params![flow.flow_id])
            .map_err(db)?;
        tx.execute("DELETE FROM rules WHERE flow_id = ?1", params![flow.flow_id])
            .map_err(db)?;

        for node in &flow.nodes {
            tx.execute(
                "INSERT INTO nodes (flow_id, node_id, node_type, parent_id, order_index, config)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    flow.flow_id,
                    node.id,
                    node.node_type.as_str(),
                    node.parent_id,
                    node.order_index,
                    node.config.to_string()
                ],
            )
            .map_err(db)?;
        }
        for rule in &flow.rules {
            tx.execute(
                "INSERT INTO rules (flow_id, rule_id, gate_id, name, condition, priority, weight, critical)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    flow.flow_id,
                    rule.id,
                    rule.gate_id,
                    rule.name,
                    serde_json::to_string(&rule.condition)?,
                    rule.priority,
                    rule.weight,
                    rule.critical
                ],
            )
            .map_err(db)?;
        }

        tx.commit().map_err(db)?;
        debug!(flow_id = %flow.flow_id, nodes = flow.nodes.len(), rules = flow.rules.len(), "Flow saved");
        Ok(())
    }

    fn load_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>> {
        let conn = self.lock()?;
        let definition: Option<String> = conn
            .query_row(
                "SELECT definition FROM flows WHERE flow_id = ?1",
                params![flow_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        match definition {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO executions (id, flow_id, status, reason, initial_context, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                execution.id.0,
                execution.flow_id,
                execution.status.as_str(),
                execution.reason,
                execution.initial_context.to_string(),
                ts(&execution.started_at),
                execution.ended_at.as_ref().map(ts)
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn update_execution_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        reason: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE executions SET status = ?2, reason = ?3, ended_at = ?4 WHERE id = ?1",
                params![id.0, status.as_str(), reason, ended_at.as_ref().map(ts)],
            )
            .map_err(db)?;
        if changed == 0 {
            return Err(GateflowError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, flow_id, status, reason, initial_context, started_at, ended_at
                 FROM executions WHERE id = ?1",
                params![id.0],
                read_execution,
            )
            .optional()
            .map_err(db)?;
        row.map(execution_from_row).transpose()
    }

    fn list_executions(&self, flow_id: Option<&str>, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, flow_id, status, reason, initial_context, started_at, ended_at
                 FROM executions
                 WHERE (?1 IS NULL OR flow_id = ?1)
                 ORDER BY started_at DESC LIMIT ?2",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![flow_id, limit as i64], read_execution)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        rows.into_iter().map(execution_from_row).collect()
    }

    fn insert_node_execution(&self, record: &NodeExecution) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node_executions
                (visit_id, execution_id, node_id, status, output, error, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.visit_id,
                record.execution_id.0,
                record.node_id,
                record.status.as_str(),
                record.output.to_string(),
                record.error,
                ts(&record.started_at),
                ts(&record.ended_at)
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn node_executions(&self, id: &ExecutionId) -> Result<Vec<NodeExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT visit_id, node_id, status, output, error, started_at, ended_at
                 FROM node_executions WHERE execution_id = ?1
                 ORDER BY started_at ASC, rowid ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        rows.into_iter()
            .map(|(visit_id, node_id, status, output, error, started, ended)| {
                Ok(NodeExecution {
                    visit_id,
                    execution_id: id.clone(),
                    node_id,
                    status: NodeStatus::parse(&status)
                        .ok_or_else(|| db(format!("unknown node status '{}'", status)))?,
                    output: parse_json(&output)?,
                    error,
                    started_at: parse_ts(&started)?,
                    ended_at: parse_ts(&ended)?,
                })
            })
            .collect()
    }

    fn insert_gate_evaluation(&self, evaluation: &GateEvaluation) -> Result<()> {
        let execution_id = evaluation
            .execution_id
            .as_ref()
            .ok_or_else(|| db("gate evaluation has no execution id"))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO gate_evaluations
                (execution_id, gate_node_id, aggregate_score, decision, reason,
                 rule_results, critical_failures, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                execution_id.0,
                evaluation.gate_node_id,
                evaluation.aggregate_score,
                evaluation.decision,
                evaluation.reason,
                serde_json::to_string(&evaluation.rule_results)?,
                serde_json::to_string(&evaluation.critical_failures)?,
                ts(&evaluation.evaluated_at)
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn gate_evaluations(&self, id: &ExecutionId) -> Result<Vec<GateEvaluation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT gate_node_id, aggregate_score, decision, reason, rule_results,
                        critical_failures, evaluated_at
                 FROM gate_evaluations WHERE execution_id = ?1 ORDER BY id ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        rows.into_iter()
            .map(|(gate, score, decision, reason, results, critical, at)| {
                Ok(GateEvaluation {
                    execution_id: Some(id.clone()),
                    gate_node_id: gate,
                    rule_results: serde_json::from_str(&results)?,
                    aggregate_score: score,
                    decision,
                    reason,
                    critical_failures: serde_json::from_str(&critical)?,
                    evaluated_at: parse_ts(&at)?,
                })
            })
            .collect()
    }

    fn put_working_memory(
        &self,
        id: &ExecutionId,
        key: &str,
        value: &serde_json::Value,
        written_by: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO working_memory (execution_id, key, value, written_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(execution_id, key) DO UPDATE SET
                value = excluded.value,
                written_by = excluded.written_by,
                updated_at = excluded.updated_at",
            params![id.0, key, value.to_string(), written_by, ts(&Utc::now())],
        )
        .map_err(db)?;
        Ok(())
    }

    fn load_working_memory(
        &self,
        id: &ExecutionId,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM working_memory WHERE execution_id = ?1 ORDER BY key")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        let mut map = serde_json::Map::new();
        for (key, value) in rows {
            map.insert(key, parse_json(&value)?);
        }
        Ok(map)
    }

    fn record_episode(
        &self,
        flow_id: &str,
        signature: &str,
        example: &EpisodicExample,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO episodic_memory (flow_id, signature, input, output, success, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                flow_id,
                signature,
                example.input.to_string(),
                example.output.to_string(),
                example.success,
                ts(&example.recorded_at)
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn episodes(
        &self,
        flow_id: &str,
        signature: &str,
        limit: usize,
    ) -> Result<Vec<EpisodicExample>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT input, output, success, recorded_at FROM episodic_memory
                 WHERE flow_id = ?1 AND signature = ?2
                 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![flow_id, signature, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        rows.into_iter()
            .map(|(input, output, success, at)| {
                Ok(EpisodicExample {
                    input: parse_json(&input)?,
                    output: parse_json(&output)?,
                    success,
                    recorded_at: parse_ts(&at)?,
                })
            })
            .collect()
    }

    fn insert_assignment(&self, assignment: &AgentAssignment) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO agent_assignments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                ASSIGNMENT_COLUMNS
            ),
            params![
                assignment.id,
                assignment.execution_id.0,
                assignment.node_id,
                assignment.agent_id,
                assignment.attempt as i64,
                ts(&assignment.assigned_at),
                assignment.completed_at.as_ref().map(ts),
                assignment.success,
                assignment.performance_score
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn complete_assignment(
        &self,
        assignment_id: &str,
        success: bool,
        performance_score: Option<f64>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE agent_assignments
                 SET completed_at = ?2, success = ?3, performance_score = ?4
                 WHERE assignment_id = ?1",
                params![assignment_id, ts(&completed_at), success, performance_score],
            )
            .map_err(db)?;
        if changed == 0 {
            return Err(db(format!("unknown assignment '{}'", assignment_id)));
        }
        Ok(())
    }

    fn assignments(&self, id: &ExecutionId) -> Result<Vec<AgentAssignment>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM agent_assignments WHERE execution_id = ?1
                 ORDER BY assigned_at ASC, rowid ASC",
                ASSIGNMENT_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], read_assignment)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        rows.into_iter().map(assignment_from_row).collect()
    }

    fn agent_performance(&self, agent_id: Option<&str>) -> Result<Vec<AgentPerformance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM agent_assignments
                 WHERE completed_at IS NOT NULL AND (?1 IS NULL OR agent_id = ?1)",
                ASSIGNMENT_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![agent_id], read_assignment)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        let mut tallies: BTreeMap<String, PerformanceTally> = BTreeMap::new();
        for row in rows {
            let assignment = assignment_from_row(row)?;
            tallies
                .entry(assignment.agent_id.clone())
                .or_default()
                .add(&assignment);
        }
        Ok(tallies
            .into_iter()
            .map(|(agent, tally)| tally.finish(agent))
            .collect())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_log (execution_id, sequence, node_id, event_type, actor, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.execution_id.0,
                entry.sequence as i64,
                entry.node_id,
                entry.event_type.as_str(),
                entry.actor.to_string(),
                ts(&entry.timestamp),
                entry.payload.to_string()
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn audit_trail(&self, id: &ExecutionId) -> Result<Vec<AuditLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence, node_id, event_type, actor, timestamp, payload
                 FROM audit_log WHERE execution_id = ?1 ORDER BY sequence ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        rows.into_iter()
            .map(|(sequence, node_id, event_type, actor, at, payload)| {
                Ok(AuditLogEntry {
                    sequence: sequence as u64,
                    execution_id: id.clone(),
                    node_id,
                    event_type: AuditEventType::parse(&event_type)
                        .ok_or_else(|| db(format!("unknown audit event '{}'", event_type)))?,
                    actor: Actor::parse(&actor),
                    timestamp: parse_ts(&at)?,
                    payload: parse_json(&payload)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateflow_core::gate::{evaluate_gate, DecisionTable};
    use gateflow_core::tree::{AgentSpec, GateSpec, NodeDefinition};
    use serde_json::json;

    fn execution(flow_id: &str) -> Execution {
        Execution {
            id: ExecutionId::new(),
            flow_id: flow_id.to_string(),
            status: ExecutionStatus::Pending,
            reason: None,
            initial_context: json!({"applicant": "a-1"}),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn audit(id: &ExecutionId, sequence: u64) -> AuditLogEntry {
        AuditLogEntry {
            sequence,
            execution_id: id.clone(),
            node_id: Some("root".to_string()),
            event_type: AuditEventType::NodeStarted,
            actor: Actor::Engine,
            timestamp: Utc::now(),
            payload: json!({"visit_id": "v1"}),
        }
    }

    #[test]
    fn test_flow_roundtrip() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let flow = FlowDefinition::new("loan", "Loan")
            .node(NodeDefinition::root("root"))
            .node(NodeDefinition::agent("score", "root", AgentSpec::new("score it")))
            .node(NodeDefinition::gate("check", "root", GateSpec::default()))
            .simple_rule("check", "r1", json!({"field": "score", "operator": ">", "value": 1}));
        store.save_flow(&flow).unwrap();
        // saving twice replaces
        store.save_flow(&flow).unwrap();

        let loaded = store.load_flow("loan").unwrap().unwrap();
        assert_eq!(loaded, flow);
        assert!(store.load_flow("missing").unwrap().is_none());
    }

    #[test]
    fn test_execution_lifecycle() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let exec = execution("loan");
        store.insert_execution(&exec).unwrap();
        store
            .update_execution_status(&exec.id, ExecutionStatus::Running, None, None)
            .unwrap();
        store
            .update_execution_status(
                &exec.id,
                ExecutionStatus::Failed,
                Some("gate 'check' aborted"),
                Some(Utc::now()),
            )
            .unwrap();

        let loaded = store.get_execution(&exec.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.reason.as_deref(), Some("gate 'check' aborted"));
        assert!(loaded.ended_at.is_some());
        assert_eq!(loaded.initial_context, json!({"applicant": "a-1"}));

        let missing = ExecutionId::from_string("nope");
        assert!(matches!(
            store.update_execution_status(&missing, ExecutionStatus::Running, None, None),
            Err(GateflowError::ExecutionNotFound(_))
        ));
        assert_eq!(store.list_executions(Some("loan"), 10).unwrap().len(), 1);
        assert!(store.list_executions(Some("other"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_audit_log_is_append_only() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let id = ExecutionId::new();
        store.append_audit(&audit(&id, 1)).unwrap();
        store.append_audit(&audit(&id, 2)).unwrap();
        // duplicate sequence rejected
        assert!(store.append_audit(&audit(&id, 2)).is_err());

        {
            let conn = store.conn.lock().unwrap();
            let update = conn.execute(
                "UPDATE audit_log SET payload = '{}' WHERE sequence = 1",
                [],
            );
            assert!(update.unwrap_err().to_string().contains("append-only"));
            let delete = conn.execute("DELETE FROM audit_log", []);
            assert!(delete.is_err());
        }

        let trail = store.audit_trail(&id).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].sequence, 1);
        assert_eq!(trail[0].payload, json!({"visit_id": "v1"}));
        assert_eq!(trail[1].event_type, AuditEventType::NodeStarted);
    }

    #[test]
    fn test_working_memory_last_write_wins() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let id = ExecutionId::new();
        store.put_working_memory(&id, "draft", &json!("v1"), "writer").unwrap();
        store.put_working_memory(&id, "draft", &json!("v2"), "writer").unwrap();
        store.put_working_memory(&id, "score", &json!(7), "scorer").unwrap();
        let memory = store.load_working_memory(&id).unwrap();
        assert_eq!(memory.get("draft"), Some(&json!("v2")));
        assert_eq!(memory.get("score"), Some(&json!(7)));
    }

    #[test]
    fn test_episodes_most_recent_first() {
        let store = SqliteFlowStore::in_memory().unwrap();
        for i in 0..5 {
            let example = EpisodicExample {
                input: json!({"n": i}),
                output: json!(i * 2),
                success: i % 2 == 0,
                recorded_at: Utc::now(),
            };
            store.record_episode("flow", "sig", &example).unwrap();
        }
        let top = store.episodes("flow", "sig", 3).unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].input, json!({"n": 4}));
        assert_eq!(top[2].input, json!({"n": 2}));
        assert!(store.episodes("flow", "other", 3).unwrap().is_empty());
    }

    #[test]
    fn test_gate_and_node_records() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let id = ExecutionId::new();
        let eval = evaluate_gate("check", &[], &json!({}), &DecisionTable::default())
            .for_execution(&id);
        store.insert_gate_evaluation(&eval).unwrap();
        let evals = store.gate_evaluations(&id).unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].decision, "GO");
        assert_eq!(evals[0].aggregate_score, 100.0);

        let now = Utc::now();
        store
            .insert_node_execution(&NodeExecution {
                visit_id: "v1".into(),
                execution_id: id.clone(),
                node_id: "check".into(),
                status: NodeStatus::Completed,
                output: json!({"decision": "GO"}),
                error: None,
                started_at: now,
                ended_at: now,
            })
            .unwrap();
        let nodes = store.node_executions(&id).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Completed);
    }

    fn assignment(id: &ExecutionId, agent: &str, attempt: u32) -> AgentAssignment {
        AgentAssignment {
            id: format!("{}-{}", agent, attempt),
            execution_id: id.clone(),
            node_id: "score".into(),
            agent_id: agent.into(),
            attempt,
            assigned_at: Utc::now() - chrono::Duration::seconds(4),
            completed_at: None,
            success: None,
            performance_score: None,
        }
    }

    #[test]
    fn test_assignments_and_performance() {
        let store = SqliteFlowStore::in_memory().unwrap();
        let id = ExecutionId::new();
        for (agent, attempt) in [("bureau", 1), ("bureau", 2), ("backup", 1), ("bureau", 3)] {
            store.insert_assignment(&assignment(&id, agent, attempt)).unwrap();
        }
        let now = Utc::now();
        store.complete_assignment("bureau-1", false, None, now).unwrap();
        store.complete_assignment("bureau-2", true, Some(0.8), now).unwrap();
        store.complete_assignment("backup-1", true, Some(0.4), now).unwrap();
        // bureau-3 is still open
        assert!(store.complete_assignment("ghost", true, None, now).is_err());

        let listed = store.assignments(&id).unwrap();
        assert_eq!(listed.len(), 4);
        let open = listed.iter().find(|a| a.id == "bureau-3").unwrap();
        assert!(open.completed_at.is_none());
        assert_eq!(open.success, None);

        let stats = store.agent_performance(None).unwrap();
        let agents: Vec<&str> = stats.iter().map(|p| p.agent_id.as_str()).collect();
        assert_eq!(agents, vec!["backup", "bureau"]);
        let bureau = &stats[1];
        assert_eq!(bureau.total_assignments, 2);
        assert_eq!(bureau.successful, 1);
        assert_eq!(bureau.success_rate, 0.5);
        assert_eq!(bureau.avg_score, Some(0.8));
        assert!(bureau.avg_duration_secs.unwrap() >= 3.9);

        let only = store.agent_performance(Some("backup")).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].success_rate, 1.0);
        assert!(store.agent_performance(Some("nobody")).unwrap().is_empty());
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateflow.db");
        let store = SqliteFlowStore::open(&path).unwrap();
        let exec = execution("f");
        store.insert_execution(&exec).unwrap();
        drop(store);

        let reopened = SqliteFlowStore::open(&path).unwrap();
        assert!(reopened.get_execution(&exec.id).unwrap().is_some());
    }
}
