use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::tree::{ControlFlowSpec, MergeStrategy, Node, OverflowPolicy, Route};
use gateflow_core::types::{Actor, AuditEventType, NodeStatus};

use super::{Outcome, Run, Scope};

/// Resolved orchestrator_workers settings for one visit.
struct WorkerPlan<'a> {
    orchestrator: &'a str,
    synthesizer: Option<&'a str>,
    limit: usize,
    overflow: OverflowPolicy,
    subgoals_key: &'a str,
    results_key: &'a str,
}

fn role<'a>(node: &Node, name: &str, value: &'a Option<String>) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| {
        GateflowError::TreeIntegrity(format!(
            "control-flow node '{}' has no {}",
            node.id, name
        ))
    })
}

impl Run<'_> {
    pub(super) async fn run_pattern(
        &self,
        node: &Node,
        spec: &ControlFlowSpec,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        debug!(node = %node.id, pattern = spec.pattern_name(), "Running control-flow pattern");
        match spec {
            ControlFlowSpec::Chaining => {
                self.run_chain(self.exec.tree.children(&node.id), scope, cancel)
                    .await
            }
            ControlFlowSpec::Routing { routes, default } => {
                self.run_routing(node, routes, default.as_deref(), scope, cancel)
                    .await
            }
            ControlFlowSpec::Parallel { merge } => {
                self.run_parallel(node, *merge, scope, cancel).await
            }
            ControlFlowSpec::OrchestratorWorkers {
                orchestrator,
                synthesizer,
                max_workers,
                overflow,
                subgoals_key,
                results_key,
            } => {
                let plan = WorkerPlan {
                    orchestrator: role(node, "orchestrator", orchestrator)?,
                    synthesizer: synthesizer.as_deref(),
                    limit: max_workers
                        .unwrap_or(self.exec.config.default_max_workers)
                        .max(1),
                    overflow: *overflow,
                    subgoals_key,
                    results_key,
                };
                self.run_orchestrator(node, plan, scope, cancel).await
            }
            ControlFlowSpec::EvaluatorOptimizer {
                generator,
                evaluator,
                max_iterations,
                approval_key,
            } => {
                let generator = role(node, "generator", generator)?;
                let evaluator = role(node, "evaluator", evaluator)?;
                self.run_refinement(
                    node,
                    (generator, evaluator),
                    *max_iterations,
                    approval_key,
                    scope,
                    cancel,
                )
                .await
            }
        }
    }

    /// Visit the first route whose condition holds, else the default. The
    /// other children are never visited.
    async fn run_routing(
        &self,
        node: &Node,
        routes: &[Route],
        default: Option<&str>,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let context = scope.context_for(&[]);
        let mut selected = None;
        for (index, route) in routes.iter().enumerate() {
            let checked = route.when.evaluate(&context);
            if checked.passed {
                selected = Some((
                    route.target.as_str(),
                    json!({ "route": index, "target": route.target, "trace": checked.trace }),
                ));
                break;
            }
        }
        if selected.is_none() {
            selected = default.map(|target| (target, json!({ "route": "default", "target": target })));
        }

        let Some((target, payload)) = selected else {
            return Ok(Outcome::failed(format!(
                "no route of '{}' matched and no default is set",
                node.id
            )));
        };
        self.ledger.append(
            Some(&node.id),
            AuditEventType::RouteSelected,
            Actor::Rules,
            payload,
        )?;
        info!(node = %node.id, target, "Route selected");
        self.visit(target, scope, None, cancel).await
    }

    /// Run every child on its own snapshot of memory and join them.
    async fn run_parallel(
        &self,
        node: &Node,
        merge: MergeStrategy,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let children = self.exec.tree.children(&node.id);
        let group = cancel.child_token();

        let mut pending = FuturesUnordered::new();
        for (index, child) in children.iter().enumerate() {
            let mut branch = scope.fork();
            let token = group.child_token();
            pending.push(async move {
                let result = self.visit(child, &mut branch, None, &token).await;
                (index, result, branch)
            });
        }

        let mut finished: Vec<Option<(Outcome, Scope)>> = (0..children.len()).map(|_| None).collect();
        let mut first_failure = None;
        let mut first_error = None;
        while let Some((index, result, branch)) = pending.next().await {
            // siblings still close their visits before an error propagates
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    group.cancel();
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if merge == MergeStrategy::Sectioning && outcome.is_failure() && first_failure.is_none() {
                warn!(node = %node.id, branch = %children[index], "Branch failed, cancelling siblings");
                first_failure = Some(index);
                group.cancel();
            }
            finished[index] = Some((outcome, branch));
        }
        drop(pending);

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }
        let finished: Vec<(Outcome, Scope)> = finished.into_iter().flatten().collect();

        match merge {
            MergeStrategy::Sectioning => {
                if let Some(index) = first_failure {
                    let error = finished[index].0.error.clone().unwrap_or_default();
                    return Ok(Outcome::failed(format!(
                        "branch '{}' of '{}' failed: {}",
                        children[index], node.id, error
                    )));
                }
                let mut sections = Map::new();
                for (child, (outcome, branch)) in children.iter().zip(finished) {
                    self.merge_branch(scope, &node.id, branch)?;
                    sections.insert(child.clone(), outcome.output);
                }
                Ok(Outcome::completed(Value::Object(sections)))
            }
            MergeStrategy::Voting => {
                let total = finished.len();
                let mut tally: Vec<(Value, usize)> = Vec::new();
                let mut winners = Vec::new();
                for (outcome, branch) in finished {
                    if outcome.status != NodeStatus::Completed {
                        continue;
                    }
                    match tally.iter_mut().find(|(output, _)| *output == outcome.output) {
                        Some(entry) => entry.1 += 1,
                        None => tally.push((outcome.output, 1)),
                    }
                    winners.push(branch);
                }

                let successes = winners.len();
                if successes * 2 <= total {
                    return Ok(Outcome::failed_with(
                        json!({ "successes": successes, "branches": total }),
                        format!(
                            "only {} of {} branches of '{}' succeeded",
                            successes, total, node.id
                        ),
                    ));
                }

                // ties go to the earliest declared branch
                let mut majority: Option<(Value, usize)> = None;
                for (output, votes) in tally {
                    match &majority {
                        Some((_, best)) if *best >= votes => {}
                        _ => majority = Some((output, votes)),
                    }
                }
                for branch in winners {
                    self.merge_branch(scope, &node.id, branch)?;
                }
                let (output, votes) = majority.unwrap_or((Value::Null, 0));
                info!(node = %node.id, successes, total, votes, "Vote decided");
                Ok(Outcome::completed(json!({
                    "output": output,
                    "votes": votes,
                    "successes": successes,
                    "branches": total,
                })))
            }
        }
    }

    /// Let the orchestrator plan subgoals, fan them out to the workers and
    /// hand the collected results to the synthesizer.
    async fn run_orchestrator(
        &self,
        node: &Node,
        plan: WorkerPlan<'_>,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let workers: Vec<&str> = self
            .exec
            .tree
            .children(&node.id)
            .iter()
            .map(String::as_str)
            .filter(|c| *c != plan.orchestrator && Some(*c) != plan.synthesizer)
            .collect();
        if workers.is_empty() {
            return Ok(Outcome::failed(format!("'{}' has no worker children", node.id)));
        }

        let planned = self.visit(plan.orchestrator, scope, None, cancel).await?;
        if planned.is_failure() {
            return Ok(planned);
        }
        let subgoals: Vec<String> = match planned
            .output
            .get(plan.subgoals_key)
            .or_else(|| scope.memory.get(plan.subgoals_key))
        {
            Some(Value::Array(items)) => items.iter().map(subgoal_text).collect(),
            _ => {
                return Ok(Outcome::failed(format!(
                    "orchestrator '{}' produced no '{}' list",
                    plan.orchestrator, plan.subgoals_key
                )))
            }
        };

        let mut jobs = Vec::with_capacity(subgoals.len());
        for (index, goal) in subgoals.into_iter().enumerate() {
            if plan.overflow == OverflowPolicy::Reject && index >= plan.limit {
                self.ledger.append(
                    Some(&node.id),
                    AuditEventType::SubgoalRejected,
                    Actor::Engine,
                    json!({ "index": index, "goal": goal, "max_workers": plan.limit }),
                )?;
                warn!(node = %node.id, index, "Subgoal rejected, worker limit reached");
                continue;
            }
            let worker = workers[index % workers.len()];
            self.ledger.append(
                Some(&node.id),
                AuditEventType::SubgoalDispatched,
                Actor::Engine,
                json!({ "index": index, "goal": goal, "worker": worker }),
            )?;
            jobs.push((index, worker, goal, scope.fork()));
        }

        // at most `limit` workers run at once; the rest wait in order
        let mut queue = jobs.into_iter();
        let mut running = FuturesUnordered::new();
        let mut done = Vec::new();
        loop {
            while running.len() < plan.limit {
                let Some((index, worker, goal, mut branch)) = queue.next() else {
                    break;
                };
                let token = cancel.child_token();
                running.push(async move {
                    let result = self.visit(worker, &mut branch, Some(goal.clone()), &token).await;
                    (index, worker, goal, result, branch)
                });
            }
            match running.next().await {
                Some(finished) => done.push(finished),
                None => break,
            }
        }
        done.sort_by_key(|(index, ..)| *index);

        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }

        let mut results = Vec::with_capacity(done.len());
        let mut failures = Vec::new();
        let mut branches = Vec::with_capacity(done.len());
        for (index, worker, goal, result, branch) in done {
            let outcome = result?;
            if outcome.is_failure() {
                failures.push(format!(
                    "{}: {}",
                    worker,
                    outcome.error.as_deref().unwrap_or("failed")
                ));
            }
            results.push(json!({
                "index": index,
                "subgoal": goal,
                "worker": worker,
                "status": outcome.status.as_str(),
                "output": outcome.output,
            }));
            branches.push(branch);
        }
        if !failures.is_empty() {
            return Ok(Outcome::failed_with(
                Value::Array(results),
                format!(
                    "{} worker(s) of '{}' failed: {}",
                    failures.len(),
                    node.id,
                    failures.join("; ")
                ),
            ));
        }

        for branch in branches {
            self.merge_branch(scope, &node.id, branch)?;
        }
        let results = Value::Array(results);
        self.apply_writes(scope, &node.id, vec![(plan.results_key.to_string(), results.clone())])?;
        info!(node = %node.id, workers = workers.len(), "Worker results collected");

        match plan.synthesizer {
            Some(synthesizer) => self.visit(synthesizer, scope, None, cancel).await,
            None => {
                let mut output = Map::new();
                output.insert(plan.results_key.to_string(), results);
                Ok(Outcome::completed(Value::Object(output)))
            }
        }
    }

    /// Alternate generator and evaluator until the evaluator approves. Running
    /// out of iterations leaves the node unresolved, which is not a failure.
    async fn run_refinement(
        &self,
        node: &Node,
        (generator, evaluator): (&str, &str),
        max_iterations: u32,
        approval_key: &str,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let max_iterations = max_iterations.max(1);
        let mut draft = Value::Null;
        for iteration in 1..=max_iterations {
            let generated = self.visit(generator, scope, None, cancel).await?;
            if generated.is_failure() {
                return Ok(generated);
            }
            self.carry_forward(scope, generator, &generated.output)?;
            draft = generated.output;

            let verdict = self.visit(evaluator, scope, None, cancel).await?;
            if verdict.is_failure() {
                return Ok(verdict);
            }
            if approved(&verdict.output, approval_key) {
                info!(node = %node.id, iteration, "Evaluator approved");
                return Ok(Outcome::completed(json!({
                    "approved": true,
                    "iterations": iteration,
                    "output": draft,
                    "feedback": verdict.output,
                })));
            }
            debug!(node = %node.id, iteration, "Evaluator asked for a revision");
        }

        warn!(node = %node.id, max_iterations, "Evaluator never approved");
        Ok(Outcome::unresolved(json!({
            "approved": false,
            "iterations": max_iterations,
            "output": draft,
        })))
    }
}

fn subgoal_text(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("goal") {
            Some(Value::String(goal)) => goal.clone(),
            _ => item.to_string(),
        },
        other => other.to_string(),
    }
}

fn approved(verdict: &Value, key: &str) -> bool {
    match verdict {
        Value::Bool(b) => *b,
        Value::Object(map) => map.get(key).and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}
