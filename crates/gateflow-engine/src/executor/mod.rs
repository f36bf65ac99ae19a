//! Flow execution engine.
//!
//! `FlowExecutor` walks a built `FlowTree` from the root. Gate nodes are
//! scored by the gate evaluator and routed through their action table, agent
//! nodes are delegated to the configured collaborator, and control-flow nodes
//! run one of five orchestration patterns (chaining, routing, parallel,
//! orchestrator_workers, evaluator_optimizer). Every step lands in the
//! execution's audit ledger, in order, parent start before child start.
//!
//! Concurrency only happens inside `parallel` and `orchestrator_workers`
//! fan-outs: branch futures are polled concurrently within the execution's
//! task, each on a snapshot of working memory that is merged at the join.

mod agent;
mod gate;
mod patterns;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gateflow_core::config::EngineConfig;
use gateflow_core::error::Result;
use gateflow_core::event::EventBus;
use gateflow_core::traits::{AgentCollaborator, FlowStore, HumanGateCollaborator};
use gateflow_core::tree::{FlowTree, NodeKind};
use gateflow_core::types::*;

use crate::ledger::AuditLedger;
use crate::memory::WorkingMemory;

/// What the caller gets back from an execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub flow_id: String,
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    /// Output of the root node.
    pub output: Value,
    /// Working memory at the end of the execution.
    pub memory: Map<String, Value>,
    pub audit: Vec<AuditLogEntry>,
}

impl ExecutionReport {
    pub fn events(&self, event_type: AuditEventType) -> Vec<&AuditLogEntry> {
        self.audit
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Executes flows built from one `FlowTree`. The tree is shared read-only,
/// so one executor can run many executions concurrently.
pub struct FlowExecutor {
    tree: Arc<FlowTree>,
    agents: Arc<dyn AgentCollaborator>,
    human: Option<Arc<dyn HumanGateCollaborator>>,
    store: Arc<dyn FlowStore>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    human_deadline_secs: Option<u64>,
}

impl FlowExecutor {
    pub fn new(
        tree: Arc<FlowTree>,
        agents: Arc<dyn AgentCollaborator>,
        store: Arc<dyn FlowStore>,
    ) -> Self {
        Self {
            tree,
            agents,
            human: None,
            store,
            event_bus: Arc::new(EventBus::default()),
            config: EngineConfig::default(),
            human_deadline_secs: None,
        }
    }

    pub fn with_human(mut self, human: Arc<dyn HumanGateCollaborator>) -> Self {
        self.human = Some(human);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Deadline for human gates that declare none.
    pub fn with_human_deadline(mut self, secs: Option<u64>) -> Self {
        self.human_deadline_secs = secs;
        self
    }

    pub fn tree(&self) -> &FlowTree {
        &self.tree
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run the flow once against `initial_context`.
    pub async fn execute(
        &self,
        initial_context: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        self.execute_with_id(ExecutionId::new(), initial_context, cancel)
            .await
    }

    /// Like [`execute`](Self::execute) with a caller-chosen id, so observers
    /// can subscribe before the first ledger entry.
    pub async fn execute_with_id(
        &self,
        id: ExecutionId,
        initial_context: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let flow_id = self.tree.flow_id().to_string();
        self.store.insert_execution(&Execution {
            id: id.clone(),
            flow_id: flow_id.clone(),
            status: ExecutionStatus::Pending,
            reason: None,
            initial_context: initial_context.clone(),
            started_at: Utc::now(),
            ended_at: None,
        })?;

        let run = Run {
            exec: self,
            id: id.clone(),
            ledger: AuditLedger::new(id.clone(), self.store.clone(), self.event_bus.clone()),
            state: Mutex::new(RunState {
                status: ExecutionStatus::Pending,
                halts: 0,
            }),
        };
        let mut scope = Scope::new(WorkingMemory::from_context(initial_context));
        for (key, value) in scope.memory.data() {
            self.store
                .put_working_memory(&id, key, value, "initial_context")?;
        }

        run.set_status(ExecutionStatus::Running, None)?;
        run.ledger.append(
            None,
            AuditEventType::ExecutionStarted,
            Actor::Engine,
            json!({ "flow_id": flow_id, "flow_name": self.tree.name() }),
        )?;
        info!(execution_id = %id, flow_id = %flow_id, "Execution started");

        let root = self.tree.root_id().to_string();
        let (status, reason, output) = match run.visit(&root, &mut scope, None, &cancel).await {
            Ok(outcome) if outcome.status == NodeStatus::Cancelled => (
                ExecutionStatus::Failed,
                Some("cancelled".to_string()),
                outcome.output,
            ),
            Ok(outcome) if outcome.status.is_failure() => (
                ExecutionStatus::Failed,
                Some(outcome.error.unwrap_or_else(|| "root node failed".to_string())),
                outcome.output,
            ),
            Ok(outcome) => (ExecutionStatus::Completed, None, outcome.output),
            Err(e) => {
                error!(execution_id = %id, error = %e, "Execution aborted");
                (ExecutionStatus::Failed, Some(e.to_string()), Value::Null)
            }
        };

        run.set_status(status, reason.as_deref())?;
        let event = if status == ExecutionStatus::Completed {
            AuditEventType::ExecutionCompleted
        } else {
            AuditEventType::ExecutionFailed
        };
        run.ledger.append(
            None,
            event,
            Actor::Engine,
            json!({ "status": status.as_str(), "reason": reason }),
        )?;
        self.event_bus.publish(FlowEvent::ExecutionFinished {
            execution_id: id.clone(),
            status,
        });

        match &reason {
            Some(r) => warn!(execution_id = %id, status = status.as_str(), reason = %r, "Execution finished"),
            None => info!(execution_id = %id, status = status.as_str(), "Execution finished"),
        }

        Ok(ExecutionReport {
            execution_id: id,
            flow_id,
            status,
            reason,
            output,
            memory: scope.memory.into_data(),
            audit: run.ledger.entries(),
        })
    }
}

/// Result of one node visit.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub status: NodeStatus,
    pub output: Value,
    pub error: Option<String>,
}

impl Outcome {
    fn with(status: NodeStatus, output: Value, error: Option<String>) -> Self {
        Self {
            status,
            output,
            error,
        }
    }

    pub fn completed(output: Value) -> Self {
        Self::with(NodeStatus::Completed, output, None)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::with(NodeStatus::Failed, Value::Null, Some(error.into()))
    }

    pub fn failed_with(output: Value, error: impl Into<String>) -> Self {
        Self::with(NodeStatus::Failed, output, Some(error.into()))
    }

    pub fn skipped(output: Value) -> Self {
        Self::with(NodeStatus::Skipped, output, None)
    }

    pub fn unresolved(output: Value) -> Self {
        Self::with(NodeStatus::Unresolved, output, None)
    }

    pub fn cancelled() -> Self {
        Self::with(NodeStatus::Cancelled, Value::Null, Some("cancelled".to_string()))
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

/// The working memory a visit reads and writes. Branch scopes are snapshots
/// that only reach the store when merged into a non-branch scope.
///
/// `carry` holds the fields of earlier chain steps' object outputs. It is
/// transient: rules and agents see it underneath working memory, which wins
/// on a shared key.
pub(crate) struct Scope {
    pub memory: WorkingMemory,
    pub carry: Map<String, Value>,
    pub branch: bool,
}

impl Scope {
    pub fn new(memory: WorkingMemory) -> Self {
        Self {
            memory,
            carry: Map::new(),
            branch: false,
        }
    }

    pub fn fork(&self) -> Scope {
        Scope {
            memory: self.memory.fork(),
            carry: self.carry.clone(),
            branch: true,
        }
    }

    pub fn carry_forward(&mut self, output: &Value) {
        if let Value::Object(fields) = output {
            for (key, value) in fields {
                self.carry.insert(key.clone(), value.clone());
            }
        }
    }

    /// Carried fields overlaid by working memory, limited to `keys` unless
    /// none are declared.
    pub fn context_for(&self, keys: &[String]) -> Value {
        let mut merged = self.carry.clone();
        let visible = if keys.is_empty() {
            self.memory.data().clone()
        } else {
            merged.retain(|key, _| keys.contains(key));
            self.memory.view(keys)
        };
        merged.extend(visible);
        Value::Object(merged)
    }

    /// What an agent is handed: its declared keys, or the carried fields
    /// when it declares none.
    pub fn agent_input(&self, keys: &[String]) -> Map<String, Value> {
        if keys.is_empty() {
            return self.carry.clone();
        }
        match self.context_for(keys) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

struct RunState {
    status: ExecutionStatus,
    /// Human gates currently waiting; the execution is halted while > 0.
    halts: usize,
}

/// State of one execution in flight.
pub(crate) struct Run<'e> {
    exec: &'e FlowExecutor,
    id: ExecutionId,
    ledger: AuditLedger,
    state: Mutex<RunState>,
}

impl<'e> Run<'e> {
    /// Visit one node: ledger start, run by kind, persist the visit record,
    /// ledger end.
    ///
    /// A node reached after cancellation is still started and recorded as
    /// cancelled. An error inside the node is recorded as a failed visit
    /// before it propagates.
    pub(crate) fn visit<'a>(
        &'a self,
        node_id: &'a str,
        scope: &'a mut Scope,
        goal: Option<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let tree = &self.exec.tree;
            let node = tree.get(node_id)?;
            let visit_id = Uuid::new_v4().to_string();
            let started_at = Utc::now();

            self.ledger.append(
                Some(node_id),
                AuditEventType::NodeStarted,
                Actor::Engine,
                json!({
                    "visit_id": visit_id,
                    "node_type": node.kind.node_type().as_str(),
                    "goal": goal,
                }),
            )?;
            debug!(execution_id = %self.id, node_id, "Node started");

            let result = if cancel.is_cancelled() {
                Ok(Outcome::cancelled())
            } else {
                match &node.kind {
                    NodeKind::Root => self.run_chain(tree.children(node_id), scope, cancel).await,
                    NodeKind::Agent(spec) => self.run_agent(node, spec, goal, scope, cancel).await,
                    NodeKind::Gate(spec) => self.run_gate(node, spec, scope, cancel).await,
                    NodeKind::ControlFlow(spec) => self.run_pattern(node, spec, scope, cancel).await,
                }
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    let failed = Outcome::failed(e.to_string());
                    if let Err(record_error) = self.finish_visit(node_id, &visit_id, started_at, &failed) {
                        warn!(
                            execution_id = %self.id,
                            node_id,
                            error = %record_error,
                            "Could not record aborted node visit"
                        );
                    }
                    return Err(e);
                }
            };
            self.finish_visit(node_id, &visit_id, started_at, &outcome)?;
            Ok(outcome)
        })
    }

    fn finish_visit(
        &self,
        node_id: &str,
        visit_id: &str,
        started_at: DateTime<Utc>,
        outcome: &Outcome,
    ) -> Result<()> {
        self.exec.store.insert_node_execution(&NodeExecution {
            visit_id: visit_id.to_string(),
            execution_id: self.id.clone(),
            node_id: node_id.to_string(),
            status: outcome.status,
            output: outcome.output.clone(),
            error: outcome.error.clone(),
            started_at,
            ended_at: Utc::now(),
        })?;
        self.ledger.append(
            Some(node_id),
            AuditEventType::NodeCompleted,
            Actor::Engine,
            json!({
                "visit_id": visit_id,
                "status": outcome.status.as_str(),
                "error": outcome.error,
            }),
        )?;
        debug!(execution_id = %self.id, node_id, status = outcome.status.as_str(), "Node finished");
        Ok(())
    }

    /// Run nodes in order; the first failure stops the chain and becomes its
    /// outcome. Skipped and unresolved children do not stop it. Each
    /// completed child's output is carried into the context of the next.
    pub(crate) async fn run_chain(
        &self,
        children: &[String],
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let mut last = Value::Null;
        for child in children {
            let outcome = self.visit(child, scope, None, cancel).await?;
            if outcome.is_failure() {
                return Ok(outcome);
            }
            if outcome.status == NodeStatus::Completed {
                self.carry_forward(scope, child, &outcome.output)?;
                last = outcome.output;
            }
        }
        Ok(Outcome::completed(last))
    }

    /// Gates only decide; their summary is not carried.
    pub(crate) fn carry_forward(&self, scope: &mut Scope, node_id: &str, output: &Value) -> Result<()> {
        if !matches!(self.exec.tree.get(node_id)?.kind, NodeKind::Gate(_)) {
            scope.carry_forward(output);
        }
        Ok(())
    }

    /// Apply writes made by `writer`, auditing each one.
    pub(crate) fn apply_writes(
        &self,
        scope: &mut Scope,
        writer: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<()> {
        for (key, value) in writes {
            self.ledger.append(
                Some(writer),
                AuditEventType::MemoryWritten,
                Actor::Engine,
                json!({ "key": key, "value": value, "branch": scope.branch }),
            )?;
            if !scope.branch {
                self.exec
                    .store
                    .put_working_memory(&self.id, &key, &value, writer)?;
            }
            scope.memory.set(key, value);
        }
        Ok(())
    }

    /// Merge a finished branch back at a join barrier.
    pub(crate) fn merge_branch(&self, scope: &mut Scope, joiner: &str, branch: Scope) -> Result<()> {
        let applied = scope.memory.absorb(branch.memory);
        if !scope.branch {
            for (key, value) in &applied {
                self.exec
                    .store
                    .put_working_memory(&self.id, key, value, joiner)?;
            }
        }
        Ok(())
    }

    fn set_status(&self, next: ExecutionStatus, reason: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.transition(&mut state, next, reason)
    }

    fn transition(&self, state: &mut RunState, next: ExecutionStatus, reason: Option<&str>) -> Result<()> {
        if !state.status.can_transition_to(next) {
            warn!(
                execution_id = %self.id,
                from = state.status.as_str(),
                to = next.as_str(),
                "Unexpected execution status transition"
            );
        }
        let ended_at = next.is_terminal().then(Utc::now);
        self.exec
            .store
            .update_execution_status(&self.id, next, reason, ended_at)?;
        state.status = next;
        Ok(())
    }

    /// A human gate starts waiting. The first waiter halts the execution.
    pub(crate) fn enter_halt(&self, gate_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.halts == 0 {
            self.transition(&mut state, ExecutionStatus::Halted, None)?;
            self.ledger.append(
                Some(gate_id),
                AuditEventType::ExecutionHalted,
                Actor::Engine,
                json!({ "gate": gate_id }),
            )?;
            info!(execution_id = %self.id, gate = gate_id, "Execution halted for human decision");
        }
        state.halts += 1;
        Ok(())
    }

    /// A human gate stops waiting. The last waiter resumes the execution.
    pub(crate) fn leave_halt(&self, gate_id: &str, decision: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.halts = state.halts.saturating_sub(1);
        if state.halts == 0 {
            self.transition(&mut state, ExecutionStatus::Running, None)?;
            self.ledger.append(
                Some(gate_id),
                AuditEventType::ExecutionResumed,
                Actor::Engine,
                json!({ "gate": gate_id, "decision": decision }),
            )?;
            info!(execution_id = %self.id, gate = gate_id, "Execution resumed");
        }
        Ok(())
    }
}
