use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::expression::Expression;
use crate::gate::{DecisionTable, Rule};
use crate::transform::Transform;

/// Configuration of an agent node.
///
/// Input keys select what the agent sees of working memory; output keys say
/// where its result lands once the node completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// What the agent is asked to do.
    pub goal: String,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Capability tags used to route the task to a collaborator.
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// Extra attempts after an error or `success = false`.
    #[serde(default)]
    pub max_retries: u32,
    /// Per-attempt timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Hand the agent its top-K past examples for this goal.
    #[serde(default)]
    pub use_episodic: bool,
    #[serde(default)]
    pub episodic_k: Option<usize>,
    /// Store `{input, output, success}` under the goal signature afterwards.
    #[serde(default)]
    pub record_episode: bool,
    /// Explicit episodic key; derived from the goal when absent.
    #[serde(default)]
    pub goal_signature: Option<String>,
}

impl AgentSpec {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            input_keys: vec![],
            output_keys: vec![],
            required_tags: vec![],
            max_retries: 0,
            timeout_secs: None,
            use_episodic: false,
            episodic_k: None,
            record_episode: false,
            goal_signature: None,
        }
    }

    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.output_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.required_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_episodes(mut self, k: usize) -> Self {
        self.use_episodic = true;
        self.episodic_k = Some(k);
        self.record_episode = true;
        self
    }

    /// The episodic key for `goal` (which may differ from `self.goal` when a
    /// pattern hands the node a subgoal).
    pub fn signature_for(&self, goal: &str) -> String {
        match &self.goal_signature {
            Some(sig) if goal == self.goal => sig.clone(),
            _ => goal_signature(goal),
        }
    }
}

/// Stable episodic key for a goal: sha-256 of the normalised text, 16 hex chars.
pub fn goal_signature(goal: &str) -> String {
    let normalised = goal
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalised.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    #[default]
    Automated,
    /// Scored like an automated gate, then always waits for a human decision.
    #[serde(alias = "hybrid")]
    Human,
}

/// What the engine does with a decision label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GateAction {
    /// Run the guarded children (or only `next` when configured).
    Continue,
    /// The gate node fails.
    Abort,
    /// Skip the guarded children without failing.
    Skip,
    /// Re-run `target` and evaluate the gate again.
    Recycle { target: String },
    /// Wait for a human decision.
    Halt,
}

impl GateAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
            Self::Skip => "skip",
            Self::Recycle { .. } => "recycle",
            Self::Halt => "halt",
        }
    }
}

/// Configuration of a gate node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(default)]
    pub kind: GateKind,
    #[serde(flatten)]
    pub decision: DecisionTable,
    /// Decision label -> action. Unlisted labels continue on the pass label and abort otherwise.
    #[serde(default)]
    pub actions: BTreeMap<String, GateAction>,
    /// Run only this child on `continue`.
    #[serde(default)]
    pub next: Option<String>,
    /// Applied to working memory, in order, when the gate continues.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Transform>,
    /// Memory keys the rules see; empty means the whole working memory.
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Overrides the engine's recycle bound for this gate.
    #[serde(default)]
    pub max_recycles: Option<u32>,
    /// Filled from the flow's rule list at build time.
    #[serde(skip)]
    pub rules: Vec<Rule>,
}

impl Default for GateSpec {
    fn default() -> Self {
        Self {
            kind: GateKind::Automated,
            decision: DecisionTable::default(),
            actions: BTreeMap::new(),
            next: None,
            transforms: vec![],
            input_keys: vec![],
            approvers: vec![],
            deadline_secs: None,
            max_recycles: None,
            rules: vec![],
        }
    }
}

impl GateSpec {
    pub fn human(approvers: &[&str]) -> Self {
        Self {
            kind: GateKind::Human,
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, label: &str, action: GateAction) -> Self {
        self.actions.insert(label.to_string(), action);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn action_for(&self, label: &str) -> GateAction {
        if let Some(action) = self.actions.get(label) {
            return action.clone();
        }
        if label == self.decision.pass_label {
            GateAction::Continue
        } else {
            GateAction::Abort
        }
    }

    /// Labels a human may answer with.
    pub fn allowed_labels(&self) -> Vec<String> {
        let mut labels = self.decision.labels();
        for label in self.actions.keys() {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        labels
    }
}

/// One routing branch: the first `when` that holds selects `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub when: Expression,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Every branch must succeed; the first failure cancels the rest.
    #[default]
    Sectioning,
    /// A strict majority of branches must succeed.
    Voting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Extra subgoals wait for a free worker slot.
    #[default]
    Queue,
    /// Subgoals beyond `max_workers` are dropped and audited.
    Reject,
}

/// The orchestration pattern of a control-flow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum ControlFlowSpec {
    Chaining,
    Routing {
        #[serde(default)]
        routes: Vec<Route>,
        #[serde(default)]
        default: Option<String>,
    },
    Parallel {
        #[serde(default)]
        merge: MergeStrategy,
    },
    OrchestratorWorkers {
        /// Defaults to the first child.
        #[serde(default)]
        orchestrator: Option<String>,
        #[serde(default)]
        synthesizer: Option<String>,
        #[serde(default)]
        max_workers: Option<usize>,
        #[serde(default)]
        overflow: OverflowPolicy,
        /// Memory key holding the orchestrator's subgoal list.
        #[serde(default = "default_subgoals_key")]
        subgoals_key: String,
        #[serde(default = "default_results_key")]
        results_key: String,
    },
    EvaluatorOptimizer {
        /// Defaults to the first child.
        #[serde(default)]
        generator: Option<String>,
        /// Defaults to the second child.
        #[serde(default)]
        evaluator: Option<String>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        /// Field of the evaluator's output that signals approval.
        #[serde(default = "default_approval_key")]
        approval_key: String,
    },
}

fn default_subgoals_key() -> String {
    "subgoals".to_string()
}

fn default_results_key() -> String {
    "worker_results".to_string()
}

fn default_max_iterations() -> u32 {
    3
}

fn default_approval_key() -> String {
    "approved".to_string()
}

impl ControlFlowSpec {
    pub fn pattern_name(&self) -> &'static str {
        match self {
            Self::Chaining => "chaining",
            Self::Routing { .. } => "routing",
            Self::Parallel { .. } => "parallel",
            Self::OrchestratorWorkers { .. } => "orchestrator_workers",
            Self::EvaluatorOptimizer { .. } => "evaluator_optimizer",
        }
    }

    pub fn orchestrator_workers() -> Self {
        Self::OrchestratorWorkers {
            orchestrator: None,
            synthesizer: None,
            max_workers: None,
            overflow: OverflowPolicy::Queue,
            subgoals_key: default_subgoals_key(),
            results_key: default_results_key(),
        }
    }

    pub fn evaluator_optimizer(max_iterations: u32) -> Self {
        Self::EvaluatorOptimizer {
            generator: None,
            evaluator: None,
            max_iterations,
            approval_key: default_approval_key(),
        }
    }
}
