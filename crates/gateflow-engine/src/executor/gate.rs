use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::gate::{evaluate_gate_with, GateEvaluation};
use gateflow_core::tree::{GateAction, GateKind, GateSpec, Node};
use gateflow_core::types::{Actor, AuditEventType, HumanDecision, HumanGateRequest, NodeStatus};

use super::{Outcome, Run, Scope};

enum HumanWait {
    Decided(HumanDecision),
    Cancelled,
    Failed(String),
}

impl Run<'_> {
    /// Score the gate, turn its decision label into an action and carry it
    /// out. Recycles re-run the target and score again, at most
    /// `max_recycles` times.
    pub(super) async fn run_gate(
        &self,
        node: &Node,
        spec: &GateSpec,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let max_recycles = spec.max_recycles.unwrap_or(self.exec.config.max_recycles);
        let mut recycles = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::cancelled());
            }
            let context = scope.context_for(&spec.input_keys);
            let evaluation = self.score_gate(node, spec, &context)?;

            let mut label = evaluation.decision.clone();
            let mut action = spec.action_for(&label);
            if spec.kind == GateKind::Human || action == GateAction::Halt {
                match self.await_human(node, spec, &evaluation, context, cancel).await? {
                    HumanWait::Decided(decision) => {
                        label = decision.decision_label;
                        // a human answer is final
                        action = match spec.action_for(&label) {
                            GateAction::Halt => GateAction::Abort,
                            other => other,
                        };
                    }
                    HumanWait::Cancelled => return Ok(Outcome::cancelled()),
                    HumanWait::Failed(reason) => return Ok(Outcome::failed(reason)),
                }
            }

            let summary = json!({
                "decision": label,
                "score": evaluation.aggregate_score,
                "reason": evaluation.reason,
                "action": action.name(),
            });

            match action {
                GateAction::Continue => {
                    self.apply_transforms(node, spec, scope)?;
                    let guarded = match &spec.next {
                        Some(next) => vec![next.clone()],
                        None => self.exec.tree.children(&node.id).to_vec(),
                    };
                    let outcome = self.run_chain(&guarded, scope, cancel).await?;
                    if outcome.is_failure() {
                        return Ok(outcome);
                    }
                    return Ok(Outcome::completed(summary));
                }
                GateAction::Skip => return Ok(Outcome::skipped(summary)),
                GateAction::Abort | GateAction::Halt => {
                    return Ok(Outcome::failed_with(
                        summary,
                        format!(
                            "gate '{}' decided {}: {}",
                            node.id, label, evaluation.reason
                        ),
                    ));
                }
                GateAction::Recycle { target } => {
                    if recycles >= max_recycles {
                        warn!(gate = %node.id, target = %target, max_recycles, "Recycle limit reached");
                        return Ok(Outcome::failed_with(
                            summary,
                            format!(
                                "gate '{}' still decided {} after {} recycle(s) to '{}'",
                                node.id, label, recycles, target
                            ),
                        ));
                    }
                    recycles += 1;
                    self.ledger.append(
                        Some(&node.id),
                        AuditEventType::RecycleTriggered,
                        Actor::Engine,
                        json!({
                            "target": target,
                            "decision": label,
                            "recycle": recycles,
                            "max_recycles": max_recycles,
                        }),
                    )?;
                    info!(gate = %node.id, target = %target, recycle = recycles, "Recycling");

                    let outcome = self.visit(&target, scope, None, cancel).await?;
                    if outcome.is_failure() {
                        return Ok(outcome);
                    }
                    if outcome.status == NodeStatus::Completed {
                        self.carry_forward(scope, &target, &outcome.output)?;
                    }
                }
            }
        }
    }

    /// Apply the gate's transforms to working memory, auditing each step.
    fn apply_transforms(&self, node: &Node, spec: &GateSpec, scope: &mut Scope) -> Result<()> {
        for (index, transform) in spec.transforms.iter().enumerate() {
            let writes = transform.writes(scope.memory.data());
            let keys: Vec<&str> = writes.iter().map(|(k, _)| k.as_str()).collect();
            self.ledger.append(
                Some(&node.id),
                AuditEventType::TransformApplied,
                Actor::Rules,
                json!({
                    "index": index,
                    "type": transform.name(),
                    "field": transform.field(),
                    "keys": keys,
                }),
            )?;
            debug!(gate = %node.id, transform = transform.name(), ?keys, "Transform applied");
            self.apply_writes(scope, &node.id, writes)?;
        }
        Ok(())
    }

    /// Evaluate the rules, auditing every rule check and the decision.
    fn score_gate(&self, node: &Node, spec: &GateSpec, context: &Value) -> Result<GateEvaluation> {
        let mut ledger_error = None;
        let evaluation = evaluate_gate_with(&node.id, &spec.rules, context, &spec.decision, |result| {
            if ledger_error.is_some() {
                return;
            }
            let appended = self.ledger.append(
                Some(&node.id),
                AuditEventType::RuleChecked,
                Actor::Rules,
                json!({
                    "rule_id": result.rule_id,
                    "rule_name": result.rule_name,
                    "passed": result.passed,
                    "score": result.score,
                    "weight": result.weight,
                    "critical": result.critical,
                    "reason": result.reason,
                    "trace": result.trace,
                }),
            );
            if let Err(e) = appended {
                ledger_error = Some(e);
            }
        })
        .for_execution(&self.id);
        if let Some(e) = ledger_error {
            return Err(e);
        }

        self.exec.store.insert_gate_evaluation(&evaluation)?;
        self.ledger.append(
            Some(&node.id),
            AuditEventType::GateDecided,
            Actor::Rules,
            json!({
                "decision": evaluation.decision,
                "score": evaluation.aggregate_score,
                "pass_threshold": spec.decision.pass_threshold,
                "reason": evaluation.reason,
                "critical_failures": evaluation.critical_failures,
            }),
        )?;
        info!(
            gate = %node.id,
            decision = %evaluation.decision,
            score = evaluation.aggregate_score,
            "Gate decided"
        );
        Ok(evaluation)
    }

    /// Hand the decision to the human collaborator. The execution is halted
    /// until the collaborator answers or gives up.
    async fn await_human(
        &self,
        node: &Node,
        spec: &GateSpec,
        evaluation: &GateEvaluation,
        context: Value,
        cancel: &CancellationToken,
    ) -> Result<HumanWait> {
        let gate = node.id.as_str();
        let Some(human) = &self.exec.human else {
            return Ok(HumanWait::Failed(format!(
                "gate '{}' needs a human decision but no approver is configured",
                gate
            )));
        };

        let deadline_secs = spec.deadline_secs.or(self.exec.human_deadline_secs);
        let request = HumanGateRequest {
            id: Uuid::new_v4().to_string(),
            execution_id: self.id.clone(),
            gate_node_id: gate.to_string(),
            approvers: spec.approvers.clone(),
            information_package: json!({
                "flow_id": self.exec.tree.flow_id(),
                "gate": node.name,
                "decision": evaluation.decision,
                "score": evaluation.aggregate_score,
                "reason": evaluation.reason,
                "critical_failures": evaluation.critical_failures,
                "rule_results": evaluation.rule_results,
                "context": context,
            }),
            deadline: deadline_secs.map(|s| Utc::now() + chrono::Duration::seconds(s as i64)),
            allowed_labels: spec.allowed_labels(),
        };

        self.ledger.append(
            Some(gate),
            AuditEventType::HumanDecisionRequested,
            Actor::Engine,
            json!({
                "request_id": request.id,
                "approvers": request.approvers,
                "allowed_labels": request.allowed_labels,
                "deadline": request.deadline,
            }),
        )?;
        let request_id = request.id.clone();
        let allowed_labels = request.allowed_labels.clone();
        self.enter_halt(gate)?;

        let call = human.request(request);
        let waited = async {
            match deadline_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(GateflowError::HumanDecision {
                            gate: gate.to_string(),
                            reason: format!("no decision within {}s", secs),
                        })
                    }),
                None => call.await,
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = waited => Some(result),
        };

        match result {
            None => {
                self.leave_halt(gate, None)?;
                Ok(HumanWait::Cancelled)
            }
            Some(Ok(decision)) => {
                let accepted = allowed_labels.contains(&decision.decision_label);
                self.ledger.append(
                    Some(gate),
                    AuditEventType::HumanDecisionReceived,
                    Actor::Human {
                        name: decision.actor.clone(),
                    },
                    json!({
                        "request_id": request_id,
                        "decision": decision.decision_label,
                        "comment": decision.comment,
                        "accepted": accepted,
                    }),
                )?;
                if !accepted {
                    warn!(gate, decision = %decision.decision_label, "Human decision is not an allowed label");
                    self.leave_halt(gate, None)?;
                    return Ok(HumanWait::Failed(format!(
                        "gate '{}' received decision '{}' from {}, expected one of: {}",
                        gate,
                        decision.decision_label,
                        decision.actor,
                        allowed_labels.join(", ")
                    )));
                }
                self.leave_halt(gate, Some(&decision.decision_label))?;
                Ok(HumanWait::Decided(decision))
            }
            Some(Err(e)) => {
                warn!(gate, error = %e, "Human decision failed");
                self.leave_halt(gate, None)?;
                Ok(HumanWait::Failed(e.to_string()))
            }
        }
    }
}
