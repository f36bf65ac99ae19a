//! Flow tree model: a static, read-only hierarchy of typed nodes.
//!
//! A `FlowDefinition` is validated once by `FlowTree::build` and the resulting
//! tree is never mutated. Nodes live in an arena keyed by id; each node keeps
//! its parent reference and the tree keeps a precomputed child index ordered by
//! `order_index` (ties broken by id).

pub mod definition;
pub mod spec;

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::{GateflowError, Result};
use crate::gate::{sort_rules, Rule, RuleCondition};

pub use definition::{FlowDefinition, NodeDefinition, NodeType};
pub use spec::{
    goal_signature, AgentSpec, ControlFlowSpec, GateAction, GateKind, GateSpec, MergeStrategy,
    OverflowPolicy, Route,
};

/// Typed node payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Root,
    Agent(AgentSpec),
    Gate(GateSpec),
    ControlFlow(ControlFlowSpec),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Root => NodeType::Root,
            Self::Agent(_) => NodeType::Agent,
            Self::Gate(_) => NodeType::Gate,
            Self::ControlFlow(_) => NodeType::ControlFlow,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub order_index: i64,
    pub kind: NodeKind,
}

/// A validated, immutable flow tree.
#[derive(Debug, Clone)]
pub struct FlowTree {
    flow_id: String,
    name: String,
    root_id: String,
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<String>>,
    definition: FlowDefinition,
}

fn integrity(msg: impl Into<String>) -> GateflowError {
    GateflowError::TreeIntegrity(msg.into())
}

impl FlowTree {
    /// Validate a definition and build the tree.
    pub fn build(definition: FlowDefinition) -> Result<Self> {
        let mut nodes: HashMap<String, Node> = HashMap::with_capacity(definition.nodes.len());
        for def in &definition.nodes {
            if def.id.trim().is_empty() {
                return Err(integrity("node with empty id"));
            }
            if nodes.contains_key(&def.id) {
                return Err(integrity(format!("duplicate node id '{}'", def.id)));
            }
            nodes.insert(def.id.clone(), parse_node(def)?);
        }

        let roots: Vec<&Node> = nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Root))
            .collect();
        let root_id = match roots.as_slice() {
            [root] => root.id.clone(),
            [] => return Err(integrity("flow has no root node")),
            many => {
                let mut ids: Vec<&str> = many.iter().map(|n| n.id.as_str()).collect();
                ids.sort();
                return Err(integrity(format!(
                    "flow has {} root nodes: {}",
                    ids.len(),
                    ids.join(", ")
                )));
            }
        };

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes.values() {
            match (&node.kind, &node.parent_id) {
                (NodeKind::Root, Some(_)) => {
                    return Err(integrity(format!("root node '{}' has a parent", node.id)))
                }
                (NodeKind::Root, None) => {}
                (_, None) => {
                    return Err(integrity(format!("node '{}' has no parent", node.id)))
                }
                (_, Some(parent)) => {
                    if !nodes.contains_key(parent) {
                        return Err(integrity(format!(
                            "node '{}' references unknown parent '{}'",
                            node.id, parent
                        )));
                    }
                    children.entry(parent.clone()).or_default().push(node.id.clone());
                }
            }
        }
        for ids in children.values_mut() {
            ids.sort_by(|a, b| {
                let (na, nb) = (&nodes[a], &nodes[b]);
                na.order_index.cmp(&nb.order_index).then_with(|| a.cmp(b))
            });
        }

        let mut tree = Self {
            flow_id: definition.flow_id.clone(),
            name: definition.name.clone(),
            root_id,
            nodes,
            children,
            definition,
        };
        tree.check_reachable()?;
        tree.attach_rules()?;
        tree.check_nodes()?;
        Ok(tree)
    }

    /// Every node must reach the root by following parents; otherwise it
    /// sits on a cycle.
    fn check_reachable(&self) -> Result<()> {
        let limit = self.nodes.len();
        for node in self.nodes.values() {
            let mut current = node;
            let mut steps = 0;
            while let Some(parent) = &current.parent_id {
                steps += 1;
                if steps > limit {
                    return Err(integrity(format!("cycle detected at node '{}'", node.id)));
                }
                current = &self.nodes[parent];
            }
            if current.id != self.root_id {
                return Err(integrity(format!("node '{}' is not under the root", node.id)));
            }
        }
        Ok(())
    }

    fn attach_rules(&mut self) -> Result<()> {
        let mut by_gate: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut seen = HashSet::new();
        for rule in &self.definition.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(integrity(format!("duplicate rule id '{}'", rule.id)));
            }
            if !(rule.weight.is_finite() && rule.weight >= 0.0) {
                return Err(integrity(format!(
                    "rule '{}' has invalid weight {}",
                    rule.id, rule.weight
                )));
            }
            match self.nodes.get(&rule.gate_id).map(|n| &n.kind) {
                Some(NodeKind::Gate(_)) => {}
                Some(_) => {
                    return Err(integrity(format!(
                        "rule '{}' is attached to '{}', which is not a gate",
                        rule.id, rule.gate_id
                    )))
                }
                None => {
                    return Err(integrity(format!(
                        "rule '{}' references unknown gate '{}'",
                        rule.id, rule.gate_id
                    )))
                }
            }
            if let RuleCondition::Malformed { error, .. } = &rule.condition {
                warn!(
                    rule = %rule.id,
                    gate = %rule.gate_id,
                    %error,
                    "Malformed rule condition; it will fail at evaluation"
                );
            }
            by_gate.entry(rule.gate_id.clone()).or_default().push(rule.clone());
        }
        for (gate_id, mut rules) in by_gate {
            sort_rules(&mut rules);
            if let Some(Node {
                kind: NodeKind::Gate(spec),
                ..
            }) = self.nodes.get_mut(&gate_id)
            {
                spec.rules = rules;
            }
        }
        Ok(())
    }

    fn check_nodes(&mut self) -> Result<()> {
        let mut resolved: Vec<(String, ControlFlowSpec)> = Vec::new();
        for node in self.nodes.values() {
            let kids = self.children(&node.id);
            match &node.kind {
                NodeKind::Root => {}
                NodeKind::Agent(_) => {
                    if !kids.is_empty() {
                        return Err(integrity(format!(
                            "agent node '{}' cannot have children",
                            node.id
                        )));
                    }
                }
                NodeKind::Gate(spec) => self.check_gate(node, spec)?,
                NodeKind::ControlFlow(spec) => {
                    let spec = self.resolve_pattern(node, spec)?;
                    resolved.push((node.id.clone(), spec));
                }
            }
        }
        for (id, spec) in resolved {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.kind = NodeKind::ControlFlow(spec);
            }
        }
        Ok(())
    }

    fn check_gate(&self, node: &Node, spec: &GateSpec) -> Result<()> {
        if let Some(next) = &spec.next {
            self.require_child(node, next, "next")?;
        }
        if !(0.0..=100.0).contains(&spec.decision.pass_threshold) {
            return Err(integrity(format!(
                "gate '{}' pass_threshold must be within 0..=100",
                node.id
            )));
        }
        for transform in &spec.transforms {
            if let Some(field) = transform.field() {
                if field.split('.').any(str::is_empty) {
                    return Err(integrity(format!(
                        "gate '{}' {} has an invalid field path '{}'",
                        node.id,
                        transform.name(),
                        field
                    )));
                }
            }
        }
        for action in spec.actions.values() {
            if let GateAction::Recycle { target } = action {
                if !self.nodes.contains_key(target) {
                    return Err(integrity(format!(
                        "gate '{}' recycles to unknown node '{}'",
                        node.id, target
                    )));
                }
                if target == &node.id
                    || self.is_ancestor(target, &node.id)
                    || self.is_ancestor(&node.id, target)
                {
                    return Err(integrity(format!(
                        "gate '{}' cannot recycle to '{}' (itself, an ancestor or a descendant)",
                        node.id, target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate pattern arity and fill in default roles.
    fn resolve_pattern(&self, node: &Node, spec: &ControlFlowSpec) -> Result<ControlFlowSpec> {
        let kids = self.children(&node.id);
        let mut spec = spec.clone();
        match &mut spec {
            ControlFlowSpec::Chaining => {}
            ControlFlowSpec::Routing { routes, default } => {
                if routes.is_empty() && default.is_none() {
                    return Err(integrity(format!(
                        "routing node '{}' has no routes and no default",
                        node.id
                    )));
                }
                for route in routes.iter() {
                    self.require_child(node, &route.target, "route target")?;
                }
                if let Some(default) = default {
                    self.require_child(node, default, "default route")?;
                }
            }
            ControlFlowSpec::Parallel { .. } => {
                if kids.is_empty() {
                    return Err(integrity(format!(
                        "parallel node '{}' has no branches",
                        node.id
                    )));
                }
            }
            ControlFlowSpec::OrchestratorWorkers {
                orchestrator,
                synthesizer,
                max_workers,
                ..
            } => {
                let orch = match orchestrator.as_deref() {
                    Some(id) => self.require_child(node, id, "orchestrator")?.to_string(),
                    None => kids.first().cloned().ok_or_else(|| {
                        integrity(format!("orchestrator_workers node '{}' has no children", node.id))
                    })?,
                };
                if let Some(synth) = synthesizer.as_deref() {
                    self.require_child(node, synth, "synthesizer")?;
                    if synth == orch {
                        return Err(integrity(format!(
                            "node '{}' uses '{}' as both orchestrator and synthesizer",
                            node.id, synth
                        )));
                    }
                }
                let workers = kids
                    .iter()
                    .filter(|k| **k != orch && Some(k.as_str()) != synthesizer.as_deref())
                    .count();
                if workers == 0 {
                    return Err(integrity(format!(
                        "orchestrator_workers node '{}' needs at least one worker",
                        node.id
                    )));
                }
                if *max_workers == Some(0) {
                    return Err(integrity(format!("node '{}' has max_workers = 0", node.id)));
                }
                *orchestrator = Some(orch);
            }
            ControlFlowSpec::EvaluatorOptimizer {
                generator,
                evaluator,
                max_iterations,
                ..
            } => {
                let gen = match generator.as_deref() {
                    Some(id) => self.require_child(node, id, "generator")?.to_string(),
                    None => kids.first().cloned().ok_or_else(|| {
                        integrity(format!("evaluator_optimizer node '{}' has no generator", node.id))
                    })?,
                };
                let eval = match evaluator.as_deref() {
                    Some(id) => self.require_child(node, id, "evaluator")?.to_string(),
                    None => kids.iter().find(|k| **k != gen).cloned().ok_or_else(|| {
                        integrity(format!("evaluator_optimizer node '{}' has no evaluator", node.id))
                    })?,
                };
                if gen == eval {
                    return Err(integrity(format!(
                        "evaluator_optimizer node '{}' needs distinct generator and evaluator",
                        node.id
                    )));
                }
                if *max_iterations == 0 {
                    return Err(integrity(format!(
                        "evaluator_optimizer node '{}' has max_iterations = 0",
                        node.id
                    )));
                }
                *generator = Some(gen);
                *evaluator = Some(eval);
            }
        }
        Ok(spec)
    }

    fn require_child<'a>(&self, node: &Node, child: &'a str, role: &str) -> Result<&'a str> {
        if self.children(&node.id).iter().any(|c| c == child) {
            Ok(child)
        } else {
            Err(integrity(format!(
                "{} '{}' of node '{}' is not one of its children",
                role, child, node.id
            )))
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Node {
        &self.nodes[&self.root_id]
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The definition this tree was built from.
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn get(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| GateflowError::NodeNotFound(id.to_string()))
    }

    /// Child ids in execution order.
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: &str) -> Option<&Node> {
        self.nodes
            .get(id)
            .and_then(|n| n.parent_id.as_ref())
            .and_then(|p| self.nodes.get(p))
    }

    /// Whether `ancestor` lies strictly above `id`.
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut current = self.parent(id);
        while let Some(node) = current {
            if node.id == ancestor {
                return true;
            }
            current = self.parent(&node.id);
        }
        false
    }

    /// Ids of the subtree under `id` (excluding `id`), depth-first in order.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&String> = self.children(id).iter().rev().collect();
        while let Some(next) = stack.pop() {
            out.push(next.clone());
            stack.extend(self.children(next).iter().rev());
        }
        out
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}

fn parse_node(def: &NodeDefinition) -> Result<Node> {
    let config = match &def.config {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    };
    let bad_config = |e: serde_json::Error| {
        integrity(format!(
            "invalid {} config for node '{}': {}",
            def.node_type.as_str(),
            def.id,
            e
        ))
    };
    let kind = match def.node_type {
        NodeType::Root => NodeKind::Root,
        NodeType::Agent => NodeKind::Agent(serde_json::from_value(config).map_err(bad_config)?),
        NodeType::Gate => NodeKind::Gate(serde_json::from_value(config).map_err(bad_config)?),
        NodeType::ControlFlow => {
            NodeKind::ControlFlow(serde_json::from_value(config).map_err(bad_config)?)
        }
    };
    Ok(Node {
        id: def.id.clone(),
        name: def.name.clone().unwrap_or_else(|| def.id.clone()),
        parent_id: def.parent_id.clone(),
        order_index: def.order_index,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> FlowDefinition {
        FlowDefinition::new("flow", "test flow").node(NodeDefinition::root("root"))
    }

    fn err_of(def: FlowDefinition) -> String {
        match FlowTree::build(def) {
            Err(GateflowError::TreeIntegrity(msg)) => msg,
            other => panic!("expected integrity error, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn test_children_ordered_with_id_tiebreak() {
        let def = base()
            .node(NodeDefinition::agent("c", "root", AgentSpec::new("c")).with_order(2))
            .node(NodeDefinition::agent("b", "root", AgentSpec::new("b")).with_order(1))
            .node(NodeDefinition::agent("a", "root", AgentSpec::new("a")).with_order(1));
        let tree = FlowTree::build(def).unwrap();
        assert_eq!(tree.children("root"), ["a", "b", "c"]);
        assert_eq!(tree.root_id(), "root");
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_root_count() {
        let def = FlowDefinition::new("f", "f")
            .node(NodeDefinition::agent("a", "x", AgentSpec::new("a")));
        assert!(err_of(def).contains("no root"));

        let def = base().node(NodeDefinition::root("root2"));
        assert!(err_of(def).contains("2 root nodes"));
    }

    #[test]
    fn test_orphan_and_duplicate() {
        let def = base().node(NodeDefinition::agent("a", "ghost", AgentSpec::new("a")));
        assert!(err_of(def).contains("unknown parent"));

        let def = base()
            .node(NodeDefinition::agent("a", "root", AgentSpec::new("a")))
            .node(NodeDefinition::agent("a", "root", AgentSpec::new("a")));
        assert!(err_of(def).contains("duplicate node id"));
    }

    #[test]
    fn test_cycle_detected() {
        let def = base()
            .node(NodeDefinition::control_flow("x", "y", ControlFlowSpec::Chaining))
            .node(NodeDefinition::control_flow("y", "x", ControlFlowSpec::Chaining));
        assert!(err_of(def).contains("cycle"));
    }

    #[test]
    fn test_agent_must_be_leaf() {
        let def = base()
            .node(NodeDefinition::agent("a", "root", AgentSpec::new("a")))
            .node(NodeDefinition::agent("b", "a", AgentSpec::new("b")));
        assert!(err_of(def).contains("cannot have children"));
    }

    #[test]
    fn test_rules_attach_to_gates_sorted() {
        let mut def = base()
            .node(NodeDefinition::gate("g", "root", GateSpec::default()))
            .simple_rule("g", "r-low", json!({"field": "x", "operator": "IS NULL"}))
            .simple_rule("g", "r-high", json!({"field": "y", "operator": "IS NULL"}));
        def.rules[1].priority = 5;
        let tree = FlowTree::build(def).unwrap();
        match &tree.get("g").unwrap().kind {
            NodeKind::Gate(spec) => {
                let ids: Vec<&str> = spec.rules.iter().map(|r| r.id.as_str()).collect();
                assert_eq!(ids, vec!["r-high", "r-low"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let def = base()
            .node(NodeDefinition::agent("a", "root", AgentSpec::new("a")))
            .simple_rule("a", "r", json!({"field": "x", "operator": "IS NULL"}));
        assert!(err_of(def).contains("not a gate"));
    }

    #[test]
    fn test_recycle_target_rules() {
        let recycle_to = |target: &str| {
            base()
                .node(NodeDefinition::agent("draft", "root", AgentSpec::new("draft")))
                .node(NodeDefinition::gate(
                    "g",
                    "root",
                    GateSpec::default()
                        .with_action("RECYCLE", GateAction::Recycle { target: target.into() }),
                ))
                .node(NodeDefinition::agent("after", "g", AgentSpec::new("after")))
        };
        assert!(FlowTree::build(recycle_to("draft")).is_ok());
        assert!(err_of(recycle_to("root")).contains("cannot recycle"));
        assert!(err_of(recycle_to("after")).contains("cannot recycle"));
        assert!(err_of(recycle_to("g")).contains("cannot recycle"));
        assert!(err_of(recycle_to("missing")).contains("unknown node"));
    }

    #[test]
    fn test_transform_field_paths() {
        use crate::transform::Transform;
        let with_field = |field: &str| {
            base().node(NodeDefinition::gate(
                "g",
                "root",
                GateSpec::default().with_transform(Transform::RemoveField {
                    field: field.into(),
                }),
            ))
        };
        assert!(FlowTree::build(with_field("applicant.ssn")).is_ok());
        assert!(err_of(with_field("")).contains("invalid field path"));
        assert!(err_of(with_field("applicant..ssn")).contains("invalid field path"));
    }

    #[test]
    fn test_pattern_arity_and_defaults() {
        let def = base()
            .node(NodeDefinition::control_flow(
                "eo",
                "root",
                ControlFlowSpec::evaluator_optimizer(3),
            ))
            .node(NodeDefinition::agent("gen", "eo", AgentSpec::new("gen")));
        assert!(err_of(def).contains("no evaluator"));

        let def = base()
            .node(NodeDefinition::control_flow("eo", "root", ControlFlowSpec::evaluator_optimizer(3)))
            .node(NodeDefinition::agent("gen", "eo", AgentSpec::new("gen")))
            .node(NodeDefinition::agent("eval", "eo", AgentSpec::new("eval")));
        let tree = FlowTree::build(def).unwrap();
        match &tree.get("eo").unwrap().kind {
            NodeKind::ControlFlow(ControlFlowSpec::EvaluatorOptimizer {
                generator,
                evaluator,
                ..
            }) => {
                assert_eq!(generator.as_deref(), Some("gen"));
                assert_eq!(evaluator.as_deref(), Some("eval"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let def = base()
            .node(NodeDefinition::control_flow("ow", "root", ControlFlowSpec::orchestrator_workers()))
            .node(NodeDefinition::agent("plan", "ow", AgentSpec::new("plan")));
        assert!(err_of(def).contains("at least one worker"));

        let def = base()
            .node(NodeDefinition::control_flow(
                "route",
                "root",
                ControlFlowSpec::Routing {
                    routes: vec![],
                    default: Some("elsewhere".into()),
                },
            ))
            .node(NodeDefinition::agent("a", "route", AgentSpec::new("a")));
        assert!(err_of(def).contains("not one of its children"));
    }

    #[test]
    fn test_invalid_config_reported() {
        let mut node = NodeDefinition::agent("a", "root", AgentSpec::new("a"));
        node.config = json!({"input_keys": ["x"]});
        let def = base().node(node);
        assert!(err_of(def).contains("invalid agent config"));
    }

    #[test]
    fn test_descendants_and_ancestry() {
        let def = base()
            .node(NodeDefinition::control_flow("c", "root", ControlFlowSpec::Chaining))
            .node(NodeDefinition::agent("a1", "c", AgentSpec::new("a1")))
            .node(NodeDefinition::agent("a2", "c", AgentSpec::new("a2")))
            .node(NodeDefinition::agent("b", "root", AgentSpec::new("b")));
        let tree = FlowTree::build(def).unwrap();
        assert_eq!(tree.descendants("root"), vec!["c", "a1", "a2", "b"]);
        assert!(tree.is_ancestor("root", "a2"));
        assert!(tree.is_ancestor("c", "a1"));
        assert!(!tree.is_ancestor("a1", "c"));
        assert!(matches!(tree.get("nope"), Err(GateflowError::NodeNotFound(_))));
    }
}
