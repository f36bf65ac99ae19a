use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::tree::{AgentSpec, Node};
use gateflow_core::types::{
    Actor, AgentAssignment, AgentOutcome, AgentTask, AuditEventType, EpisodicExample,
};

use super::{Outcome, Run, Scope};
use crate::memory::WorkingMemory;

impl Run<'_> {
    /// Delegate an agent node's task, retrying up to `max_retries` times.
    ///
    /// `goal` overrides the node's own goal when the node runs as a worker.
    pub(super) async fn run_agent(
        &self,
        node: &Node,
        spec: &AgentSpec,
        goal: Option<String>,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let goal = goal.unwrap_or_else(|| spec.goal.clone());
        let signature = spec.signature_for(&goal);
        let flow_id = self.exec.tree.flow_id();

        let prior_examples = if spec.use_episodic {
            let k = spec.episodic_k.unwrap_or(self.exec.config.episodic_top_k);
            self.exec.store.episodes(flow_id, &signature, k)?
        } else {
            vec![]
        };

        let task = AgentTask {
            node_id: node.id.clone(),
            goal: goal.clone(),
            input_data: scope.agent_input(&spec.input_keys),
            required_tags: spec.required_tags.clone(),
            prior_examples,
        };
        let timeout = spec
            .timeout_secs
            .or(self.exec.config.default_agent_timeout_secs);
        let attempts = spec.max_retries + 1;

        let mut succeeded = None;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let assignment = self.assign(&node.id, &task, attempt)?;
            let call = self.attempt(&node.id, task.clone(), timeout);
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = call => Some(result),
            };
            let Some(result) = result else {
                self.exec
                    .store
                    .complete_assignment(&assignment, false, None, Utc::now())?;
                return Ok(Outcome::cancelled());
            };

            match result {
                Ok(outcome) => {
                    self.exec.store.complete_assignment(
                        &assignment,
                        outcome.success,
                        confidence(&outcome),
                        Utc::now(),
                    )?;
                    self.ledger.append(
                        Some(&node.id),
                        AuditEventType::AgentAttempt,
                        self.agent_actor(&outcome),
                        json!({
                            "attempt": attempt,
                            "max_attempts": attempts,
                            "assignment_id": assignment,
                            "success": outcome.success,
                            "output": outcome.output,
                        }),
                    )?;
                    if outcome.success {
                        succeeded = Some(outcome);
                        break;
                    }
                    last_error = format!("agent reported failure on attempt {}", attempt);
                }
                Err(e) => {
                    self.exec
                        .store
                        .complete_assignment(&assignment, false, None, Utc::now())?;
                    self.ledger.append(
                        Some(&node.id),
                        AuditEventType::AgentAttempt,
                        Actor::Agent {
                            id: self.exec.agents.id().to_string(),
                        },
                        json!({
                            "attempt": attempt,
                            "max_attempts": attempts,
                            "assignment_id": assignment,
                            "success": false,
                            "error": e.to_string(),
                        }),
                    )?;
                    last_error = e.to_string();
                }
            }
            warn!(node = %node.id, attempt, attempts, error = %last_error, "Agent attempt failed");
        }

        let input = json!({ "goal": goal, "input_data": task.input_data });
        match succeeded {
            Some(outcome) => {
                let mut writes = vec![(WorkingMemory::result_key(&node.id), outcome.output.clone())];
                writes.extend(WorkingMemory::extract_writes(&spec.output_keys, &outcome.output));
                self.apply_writes(scope, &node.id, writes)?;
                if spec.record_episode {
                    self.record_episode(&node.id, &signature, input, outcome.output.clone(), true)?;
                }
                info!(node = %node.id, "Agent node completed");
                Ok(Outcome::completed(outcome.output))
            }
            None => {
                if spec.record_episode {
                    self.record_episode(&node.id, &signature, input, Value::Null, false)?;
                }
                Ok(Outcome::failed(format!(
                    "agent node '{}' failed after {} attempt(s): {}",
                    node.id, attempts, last_error
                )))
            }
        }
    }

    /// Record who the attempt is handed to; returns the assignment id.
    fn assign(&self, node_id: &str, task: &AgentTask, attempt: u32) -> Result<String> {
        let assignment = AgentAssignment {
            id: Uuid::new_v4().to_string(),
            execution_id: self.id.clone(),
            node_id: node_id.to_string(),
            agent_id: self.exec.agents.assignee(task),
            attempt,
            assigned_at: Utc::now(),
            completed_at: None,
            success: None,
            performance_score: None,
        };
        self.exec.store.insert_assignment(&assignment)?;
        debug!(node = node_id, agent_id = %assignment.agent_id, attempt, "Agent assigned");
        Ok(assignment.id)
    }

    async fn attempt(
        &self,
        node_id: &str,
        task: AgentTask,
        timeout: Option<u64>,
    ) -> Result<AgentOutcome> {
        let call = self.exec.agents.execute(task);
        match timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), call)
                .await
                .map_err(|_| GateflowError::AgentTimeout {
                    node: node_id.to_string(),
                    timeout_secs: secs,
                })?,
            None => call.await,
        }
    }

    /// The agent that answered, as reported by a routing collaborator.
    fn agent_actor(&self, outcome: &AgentOutcome) -> Actor {
        let id = outcome
            .metadata
            .get("agent_id")
            .and_then(Value::as_str)
            .unwrap_or_else(|| self.exec.agents.id());
        Actor::Agent { id: id.to_string() }
    }

    fn record_episode(
        &self,
        node_id: &str,
        signature: &str,
        input: Value,
        output: Value,
        success: bool,
    ) -> Result<()> {
        let example = EpisodicExample {
            input,
            output,
            success,
            recorded_at: Utc::now(),
        };
        self.exec
            .store
            .record_episode(self.exec.tree.flow_id(), signature, &example)?;
        self.ledger.append(
            Some(node_id),
            AuditEventType::EpisodeRecorded,
            Actor::Engine,
            json!({ "goal_signature": signature, "success": success }),
        )?;
        Ok(())
    }
}

/// A self-reported `confidence` in `0.0..=1.0`, from the metadata or an
/// object output.
fn confidence(outcome: &AgentOutcome) -> Option<f64> {
    outcome
        .metadata
        .get("confidence")
        .or_else(|| outcome.output.get("confidence"))
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c))
}
