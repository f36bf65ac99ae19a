use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GateflowError, Result};
use crate::gate::{Rule, RuleCondition};

use super::spec::{AgentSpec, ControlFlowSpec, GateSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Agent,
    Gate,
    ControlFlow,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Agent => "agent",
            Self::Gate => "gate",
            Self::ControlFlow => "control_flow",
        }
    }
}

/// A node as written by a flow builder. `config` is interpreted per `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order_index: i64,
    #[serde(default)]
    pub config: Value,
}

impl NodeDefinition {
    fn new(id: &str, node_type: NodeType, parent: Option<&str>, config: Value) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            node_type,
            parent_id: parent.map(|p| p.to_string()),
            order_index: 0,
            config,
        }
    }

    pub fn root(id: &str) -> Self {
        Self::new(id, NodeType::Root, None, Value::Null)
    }

    pub fn agent(id: &str, parent: &str, spec: AgentSpec) -> Self {
        Self::new(id, NodeType::Agent, Some(parent), to_config(&spec))
    }

    pub fn gate(id: &str, parent: &str, spec: GateSpec) -> Self {
        Self::new(id, NodeType::Gate, Some(parent), to_config(&spec))
    }

    pub fn control_flow(id: &str, parent: &str, spec: ControlFlowSpec) -> Self {
        Self::new(id, NodeType::ControlFlow, Some(parent), to_config(&spec))
    }

    pub fn with_order(mut self, order_index: i64) -> Self {
        self.order_index = order_index;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

fn to_config<T: Serialize>(spec: &T) -> Value {
    serde_json::to_value(spec).unwrap_or(Value::Null)
}

/// The build-time description of a flow: its nodes and its gate rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl FlowDefinition {
    pub fn new(flow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            name: name.into(),
            description: String::new(),
            nodes: vec![],
            rules: vec![],
        }
    }

    /// Append a node, assigning the next order index among its siblings
    /// unless one was set explicitly.
    pub fn node(mut self, mut node: NodeDefinition) -> Self {
        if node.order_index == 0 {
            node.order_index = self
                .nodes
                .iter()
                .filter(|n| n.parent_id == node.parent_id)
                .count() as i64;
        }
        self.nodes.push(node);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Shorthand for a plain rule with default weight and priority.
    pub fn simple_rule(self, gate_id: &str, rule_id: &str, condition: Value) -> Self {
        self.rule(Rule {
            id: rule_id.to_string(),
            gate_id: gate_id.to_string(),
            name: rule_id.to_string(),
            description: None,
            condition: RuleCondition::from_wire(condition),
            priority: 0,
            weight: 1.0,
            critical: false,
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| GateflowError::Config(format!("flow definition: {}", e)))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| GateflowError::Config(format!("flow definition: {}", e)))
    }

    /// Load a definition file; `.toml` files are TOML, everything else JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GateflowError::ConfigNotFound(path.display().to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
