use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::gate::GateEvaluation;
use crate::tree::FlowDefinition;
use crate::types::*;

/// External reasoning collaborator invoked at agent nodes.
pub trait AgentCollaborator: Send + Sync + 'static {
    /// Collaborator identifier, recorded as the actor of agent attempts.
    fn id(&self) -> &str;

    /// Capability tags, used when several collaborators are registered.
    fn tags(&self) -> &[String] {
        &[]
    }

    /// The collaborator that will actually handle `task`, recorded on the
    /// task's assignment. Routing collaborators name the agent they pick.
    fn assignee(&self, _task: &AgentTask) -> String {
        self.id().to_string()
    }

    /// Perform one attempt of a task.
    fn execute(&self, task: AgentTask) -> BoxFuture<'_, Result<AgentOutcome>>;
}

/// Decision source for human gates.
pub trait HumanGateCollaborator: Send + Sync + 'static {
    /// Ask for a decision and wait for it. Deadlines are the collaborator's
    /// to enforce; a missed deadline is a `HumanDecision` error.
    fn request(&self, request: HumanGateRequest) -> BoxFuture<'_, Result<HumanDecision>>;
}

/// Durable storage for flows, executions and the audit ledger.
///
/// Ledger rows are append-only; implementations must never update or delete
/// them.
pub trait FlowStore: Send + Sync + 'static {
    /// Persist a flow definition (nodes and rules), replacing an older copy.
    fn save_flow(&self, flow: &FlowDefinition) -> Result<()>;

    fn load_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>>;

    fn insert_execution(&self, execution: &Execution) -> Result<()>;

    fn update_execution_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        reason: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<Execution>>;

    fn list_executions(&self, flow_id: Option<&str>, limit: usize) -> Result<Vec<Execution>>;

    fn insert_node_execution(&self, record: &NodeExecution) -> Result<()>;

    fn node_executions(&self, id: &ExecutionId) -> Result<Vec<NodeExecution>>;

    fn insert_gate_evaluation(&self, evaluation: &GateEvaluation) -> Result<()>;

    fn gate_evaluations(&self, id: &ExecutionId) -> Result<Vec<GateEvaluation>>;

    fn put_working_memory(
        &self,
        id: &ExecutionId,
        key: &str,
        value: &serde_json::Value,
        written_by: &str,
    ) -> Result<()>;

    fn load_working_memory(&self, id: &ExecutionId)
        -> Result<serde_json::Map<String, serde_json::Value>>;

    fn record_episode(&self, flow_id: &str, signature: &str, example: &EpisodicExample)
        -> Result<()>;

    /// Most recent examples first.
    fn episodes(&self, flow_id: &str, signature: &str, limit: usize)
        -> Result<Vec<EpisodicExample>>;

    fn insert_assignment(&self, assignment: &AgentAssignment) -> Result<()>;

    /// Close an open assignment; closing an unknown id is an error.
    fn complete_assignment(
        &self,
        assignment_id: &str,
        success: bool,
        performance_score: Option<f64>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Assignments of one execution, in the order they were made.
    fn assignments(&self, id: &ExecutionId) -> Result<Vec<AgentAssignment>>;

    /// Statistics over completed assignments, one entry per agent, ordered
    /// by agent id. `agent_id` narrows the result to one agent.
    fn agent_performance(&self, agent_id: Option<&str>) -> Result<Vec<AgentPerformance>>;

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Ledger entries ordered by sequence.
    fn audit_trail(&self, id: &ExecutionId) -> Result<Vec<AuditLogEntry>>;
}
