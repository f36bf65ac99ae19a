use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::traits::AgentCollaborator;
use gateflow_core::types::{AgentOutcome, AgentTask};

/// Routes each task to the registered collaborator whose tags best match the
/// task's `required_tags`, falling back to the first registered one.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn AgentCollaborator>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn AgentCollaborator>) {
        info!(agent_id = %agent.id(), tags = ?agent.tags(), "Agent registered");
        self.agents.push(agent);
    }

    pub fn with(mut self, agent: Arc<dyn AgentCollaborator>) -> Self {
        self.register(agent);
        self
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Score a collaborator against required tags. Higher is better.
    pub fn match_score(agent: &dyn AgentCollaborator, required_tags: &[String]) -> f64 {
        if required_tags.is_empty() {
            return 0.0;
        }
        let tags = agent.tags();
        let matched = required_tags
            .iter()
            .filter(|t| tags.iter().any(|a| a.eq_ignore_ascii_case(t)))
            .count();
        if matched == required_tags.len() {
            20.0 + matched as f64
        } else {
            matched as f64 * 5.0
        }
    }

    /// Pick the best collaborator; ties go to the earliest registered.
    pub fn route(&self, required_tags: &[String]) -> Option<&Arc<dyn AgentCollaborator>> {
        let mut best: Option<(&Arc<dyn AgentCollaborator>, f64)> = None;
        for agent in &self.agents {
            let score = Self::match_score(agent.as_ref(), required_tags);
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((agent, score)),
            }
        }
        best.map(|(a, _)| a)
    }
}

impl AgentCollaborator for AgentRegistry {
    fn id(&self) -> &str {
        "registry"
    }

    fn assignee(&self, task: &AgentTask) -> String {
        self.route(&task.required_tags)
            .map(|agent| agent.id().to_string())
            .unwrap_or_else(|| self.id().to_string())
    }

    fn execute(&self, task: AgentTask) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(async move {
            let agent = self.route(&task.required_tags).ok_or_else(|| {
                GateflowError::AgentDelegation {
                    node: task.node_id.clone(),
                    message: "no agents registered".to_string(),
                }
            })?;
            debug!(agent_id = %agent.id(), node = %task.node_id, "Routing task to agent");

            let agent_id = agent.id().to_string();
            let mut outcome = agent.execute(task).await?;
            match outcome.metadata {
                serde_json::Value::Object(ref mut map) => {
                    map.entry("agent_id")
                        .or_insert_with(|| serde_json::Value::String(agent_id));
                }
                serde_json::Value::Null => {
                    outcome.metadata = serde_json::json!({ "agent_id": agent_id });
                }
                _ => {}
            }
            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateflow_test_utils::ScriptedAgent;

    fn task(tags: &[&str]) -> AgentTask {
        AgentTask {
            node_id: "n".into(),
            goal: "g".into(),
            input_data: Default::default(),
            required_tags: tags.iter().map(|t| t.to_string()).collect(),
            prior_examples: vec![],
        }
    }

    #[tokio::test]
    async fn routes_by_tags() {
        let registry = AgentRegistry::new()
            .with(Arc::new(ScriptedAgent::new("writer").with_tags(&["draft"]).default_output(serde_json::json!("w"))))
            .with(Arc::new(ScriptedAgent::new("lawyer").with_tags(&["legal", "review"]).default_output(serde_json::json!("l"))));

        let out = registry.execute(task(&["legal"])).await.unwrap();
        assert_eq!(out.output, serde_json::json!("l"));
        assert_eq!(out.metadata["agent_id"], "lawyer");

        // full match beats partial match
        assert_eq!(registry.route(&["legal".into(), "review".into()]).unwrap().id(), "lawyer");

        // no tags: first registered
        let out = registry.execute(task(&[])).await.unwrap();
        assert_eq!(out.metadata["agent_id"], "writer");
    }

    #[test]
    fn assignee_names_the_routed_agent() {
        let registry = AgentRegistry::new()
            .with(Arc::new(ScriptedAgent::new("writer").with_tags(&["draft"])))
            .with(Arc::new(ScriptedAgent::new("lawyer").with_tags(&["legal"])));
        assert_eq!(registry.assignee(&task(&["legal"])), "lawyer");
        assert_eq!(registry.assignee(&task(&[])), "writer");
        assert_eq!(AgentRegistry::new().assignee(&task(&["legal"])), "registry");
    }

    #[tokio::test]
    async fn empty_registry_is_delegation_error() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.execute(task(&[])).await,
            Err(GateflowError::AgentDelegation { .. })
        ));
    }
}
