//! Scripted collaborators and fixtures shared by the Gateflow test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::gate::GateEvaluation;
use gateflow_core::traits::{AgentCollaborator, FlowStore, HumanGateCollaborator};
use gateflow_core::tree::{FlowDefinition, FlowTree};
use gateflow_core::types::*;
use gateflow_store::SqliteFlowStore;

/// One scripted answer from a [`ScriptedAgent`].
#[derive(Debug, Clone)]
pub struct Reply {
    result: std::result::Result<AgentOutcome, String>,
    delay: Option<Duration>,
}

impl Reply {
    /// A successful outcome.
    pub fn ok(output: Value) -> Self {
        Self {
            result: Ok(AgentOutcome::success(output)),
            delay: None,
        }
    }

    /// The agent answers but reports failure.
    pub fn fail(output: Value) -> Self {
        Self {
            result: Ok(AgentOutcome::failure(output)),
            delay: None,
        }
    }

    /// The delegation itself errors.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            delay: None,
        }
    }

    /// Answer only after `delay`.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// An agent that answers from per-node or per-goal reply queues.
///
/// Each queue is consumed front to back and its last reply repeats. Goal
/// scripts win over node scripts; with neither, the default output is used,
/// or the task's goal and input are echoed back.
#[derive(Default)]
pub struct ScriptedAgent {
    id: String,
    tags: Vec<String>,
    by_node: Mutex<HashMap<String, VecDeque<Reply>>>,
    by_goal: Mutex<HashMap<String, VecDeque<Reply>>>,
    default_output: Option<Value>,
    calls: Mutex<Vec<AgentTask>>,
}

impl ScriptedAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn default_output(mut self, output: Value) -> Self {
        self.default_output = Some(output);
        self
    }

    pub fn on_node(self, node_id: &str, replies: Vec<Reply>) -> Self {
        self.by_node
            .lock()
            .unwrap()
            .insert(node_id.to_string(), replies.into());
        self
    }

    pub fn on_goal(self, goal: &str, replies: Vec<Reply>) -> Self {
        self.by_goal
            .lock()
            .unwrap()
            .insert(goal.to_string(), replies.into());
        self
    }

    /// Every task received, in arrival order.
    pub fn calls(&self) -> Vec<AgentTask> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.node_id == node_id)
            .count()
    }

    fn next_reply(&self, task: &AgentTask) -> Option<Reply> {
        let take = |queues: &Mutex<HashMap<String, VecDeque<Reply>>>, key: &str| {
            let mut queues = queues.lock().unwrap();
            let queue = queues.get_mut(key)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };
        take(&self.by_goal, &task.goal).or_else(|| take(&self.by_node, &task.node_id))
    }
}

impl AgentCollaborator for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn execute(&self, task: AgentTask) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(task.clone());
            let reply = self.next_reply(&task);
            let reply = match reply {
                Some(reply) => reply,
                None => Reply::ok(self.default_output.clone().unwrap_or_else(|| {
                    json!({ "goal": task.goal, "input": task.input_data })
                })),
            };
            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            reply.result.map_err(|message| GateflowError::AgentDelegation {
                node: task.node_id.clone(),
                message,
            })
        })
    }
}

/// A human approver that answers from a list of labels, the last one
/// repeating. An approver with no labels never answers.
#[derive(Default)]
pub struct ScriptedApprover {
    actor: String,
    answers: Mutex<VecDeque<String>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<HumanGateRequest>>,
}

impl ScriptedApprover {
    pub fn new(actor: &str, answers: &[&str]) -> Self {
        Self {
            actor: actor.to_string(),
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn silent(actor: &str) -> Self {
        Self::new(actor, &[])
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<HumanGateRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_answer(&self) -> Option<String> {
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        }
    }
}

impl HumanGateCollaborator for ScriptedApprover {
    fn request(&self, request: HumanGateRequest) -> BoxFuture<'_, Result<HumanDecision>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_answer() {
                Some(label) => Ok(HumanDecision::new(label, self.actor.clone())),
                None => futures::future::pending().await,
            }
        })
    }
}

/// A fresh in-memory store.
pub fn memory_store() -> Arc<SqliteFlowStore> {
    Arc::new(SqliteFlowStore::in_memory().expect("in-memory store"))
}

/// A file-backed store in a temp directory; keep the guard alive.
pub fn temp_store() -> (Arc<SqliteFlowStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteFlowStore::open(&dir.path().join("gateflow.db")).expect("open store");
    (Arc::new(store), dir)
}

/// A store that fails every working-memory write to one key and otherwise
/// delegates to an in-memory SQLite store.
pub struct FaultyStore {
    inner: SqliteFlowStore,
    poisoned_key: String,
}

impl FaultyStore {
    pub fn failing_writes_to(key: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteFlowStore::in_memory().expect("in-memory store"),
            poisoned_key: key.to_string(),
        })
    }
}

impl FlowStore for FaultyStore {
    fn save_flow(&self, flow: &FlowDefinition) -> Result<()> {
        self.inner.save_flow(flow)
    }

    fn load_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>> {
        self.inner.load_flow(flow_id)
    }

    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.inner.insert_execution(execution)
    }

    fn update_execution_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        reason: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.update_execution_status(id, status, reason, ended_at)
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        self.inner.get_execution(id)
    }

    fn list_executions(&self, flow_id: Option<&str>, limit: usize) -> Result<Vec<Execution>> {
        self.inner.list_executions(flow_id, limit)
    }

    fn insert_node_execution(&self, record: &NodeExecution) -> Result<()> {
        self.inner.insert_node_execution(record)
    }

    fn node_executions(&self, id: &ExecutionId) -> Result<Vec<NodeExecution>> {
        self.inner.node_executions(id)
    }

    fn insert_gate_evaluation(&self, evaluation: &GateEvaluation) -> Result<()> {
        self.inner.insert_gate_evaluation(evaluation)
    }

    fn gate_evaluations(&self, id: &ExecutionId) -> Result<Vec<GateEvaluation>> {
        self.inner.gate_evaluations(id)
    }

    fn put_working_memory(
        &self,
        id: &ExecutionId,
        key: &str,
        value: &Value,
        written_by: &str,
    ) -> Result<()> {
        if key == self.poisoned_key {
            return Err(GateflowError::Database(format!("disk full writing '{}'", key)));
        }
        self.inner.put_working_memory(id, key, value, written_by)
    }

    fn load_working_memory(&self, id: &ExecutionId) -> Result<Map<String, Value>> {
        self.inner.load_working_memory(id)
    }

    fn record_episode(&self, flow_id: &str, signature: &str, example: &EpisodicExample) -> Result<()> {
        self.inner.record_episode(flow_id, signature, example)
    }

    fn episodes(&self, flow_id: &str, signature: &str, limit: usize) -> Result<Vec<EpisodicExample>> {
        self.inner.episodes(flow_id, signature, limit)
    }

    fn insert_assignment(&self, assignment: &AgentAssignment) -> Result<()> {
        self.inner.insert_assignment(assignment)
    }

    fn complete_assignment(
        &self,
        assignment_id: &str,
        success: bool,
        performance_score: Option<f64>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .complete_assignment(assignment_id, success, performance_score, completed_at)
    }

    fn assignments(&self, id: &ExecutionId) -> Result<Vec<AgentAssignment>> {
        self.inner.assignments(id)
    }

    fn agent_performance(&self, agent_id: Option<&str>) -> Result<Vec<AgentPerformance>> {
        self.inner.agent_performance(agent_id)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.inner.append_audit(entry)
    }

    fn audit_trail(&self, id: &ExecutionId) -> Result<Vec<AuditLogEntry>> {
        self.inner.audit_trail(id)
    }
}

/// Build a tree, panicking on integrity errors.
pub fn build_tree(definition: FlowDefinition) -> Arc<FlowTree> {
    Arc::new(FlowTree::build(definition).expect("valid flow tree"))
}
