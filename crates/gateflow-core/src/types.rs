use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a whole execution.
///
/// `Pending -> Running -> {Completed, Failed, Halted}`; `Halted` goes back to
/// `Running` once a human decision arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Halted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Halted => "halted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "halted" => Some(Self::Halted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Halted)
                | (Halted, Running)
                | (Halted, Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    /// Not run because a gate decided to hold it back.
    Skipped,
    /// An evaluator/optimizer loop hit its iteration cap without approval.
    Unresolved,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Unresolved => "unresolved",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "unresolved" => Some(Self::Unresolved),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Failures propagate to the parent pattern; everything else does not.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub flow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub initial_context: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// One record per node visit, written when the visit ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub visit_id: String,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One agent attempt at a node, as handed to a specific collaborator.
///
/// Inserted when the attempt starts; `completed_at`, `success` and
/// `performance_score` are filled in when it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub id: String,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub agent_id: String,
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: Option<bool>,
    /// Self-reported confidence in `0.0..=1.0`, when the agent gave one.
    #[serde(default)]
    pub performance_score: Option<f64>,
}

/// Aggregated results of an agent's completed assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub total_assignments: u64,
    pub successful: u64,
    pub success_rate: f64,
    pub avg_score: Option<f64>,
    pub avg_duration_secs: Option<f64>,
}

/// Kind of an audit ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionHalted,
    ExecutionResumed,
    NodeStarted,
    NodeCompleted,
    RuleChecked,
    GateDecided,
    RouteSelected,
    RecycleTriggered,
    MemoryWritten,
    TransformApplied,
    AgentAttempt,
    SubgoalDispatched,
    SubgoalRejected,
    EpisodeRecorded,
    HumanDecisionRequested,
    HumanDecisionReceived,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionHalted => "execution_halted",
            Self::ExecutionResumed => "execution_resumed",
            Self::NodeStarted => "node_started",
            Self::NodeCompleted => "node_completed",
            Self::RuleChecked => "rule_checked",
            Self::GateDecided => "gate_decided",
            Self::RouteSelected => "route_selected",
            Self::RecycleTriggered => "recycle_triggered",
            Self::MemoryWritten => "memory_written",
            Self::TransformApplied => "transform_applied",
            Self::AgentAttempt => "agent_attempt",
            Self::SubgoalDispatched => "subgoal_dispatched",
            Self::SubgoalRejected => "subgoal_rejected",
            Self::EpisodeRecorded => "episode_recorded",
            Self::HumanDecisionRequested => "human_decision_requested",
            Self::HumanDecisionReceived => "human_decision_received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    Engine,
    Rules,
    Agent { id: String },
    Human { name: String },
}

impl Actor {
    /// Parse the `Display` form back (`engine`, `rules`, `agent:<id>`, `human:<name>`).
    pub fn parse(s: &str) -> Self {
        if let Some(id) = s.strip_prefix("agent:") {
            Self::Agent { id: id.to_string() }
        } else if let Some(name) = s.strip_prefix("human:") {
            Self::Human {
                name: name.to_string(),
            }
        } else if s == "rules" {
            Self::Rules
        } else {
            Self::Engine
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => f.write_str("engine"),
            Self::Rules => f.write_str("rules"),
            Self::Agent { id } => write!(f, "agent:{}", id),
            Self::Human { name } => write!(f, "human:{}", name),
        }
    }
}

/// An immutable, strictly ordered ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: u64,
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub node_id: Option<String>,
    pub event_type: AuditEventType,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A past `{input, output, success}` example stored under a goal signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicExample {
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub success: bool,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// Task handed to an agent collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// Node that delegated the task (informational for the collaborator).
    pub node_id: String,
    pub goal: String,
    /// The node's declared input keys, or the fields carried from earlier
    /// chain steps when it declares none.
    #[serde(default)]
    pub input_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub prior_examples: Vec<EpisodicExample>,
}

/// Result returned by an agent collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_success() -> bool {
    true
}

impl AgentOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            output,
            success: true,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failure(output: serde_json::Value) -> Self {
        Self {
            output,
            success: false,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A request for a human decision at a gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanGateRequest {
    pub id: String,
    pub execution_id: ExecutionId,
    pub gate_node_id: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Scores, reasons and context shown to the approver.
    #[serde(default)]
    pub information_package: serde_json::Value,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Labels the gate knows how to route.
    #[serde(default)]
    pub allowed_labels: Vec<String>,
}

/// The human side of a gate, delivered asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanDecision {
    pub decision_label: String,
    pub actor: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl HumanDecision {
    pub fn new(label: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            decision_label: label.into(),
            actor: actor.into(),
            timestamp: Utc::now(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Events published on the [`crate::event::EventBus`].
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A ledger entry was appended.
    Audit(AuditLogEntry),
    /// A gate is waiting for a human decision.
    HumanDecisionRequested { request: HumanGateRequest },
    /// A pending human decision was answered.
    HumanDecisionResolved {
        request_id: String,
        decision_label: String,
    },
    /// An execution reached a terminal state.
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
}
