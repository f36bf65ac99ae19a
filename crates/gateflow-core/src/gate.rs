//! Gate evaluator: folds a gate's rules into one weighted score and a decision label.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::expression::{Expression, TraceLeaf};
use crate::types::ExecutionId;

/// A rule's condition as it was found at build time.
///
/// Malformed wire conditions are kept rather than rejected so the flow still
/// builds; at evaluation time they fail with an explanatory reason.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCondition {
    Parsed(Expression),
    Malformed { raw: Value, error: String },
}

impl RuleCondition {
    pub fn from_wire(raw: Value) -> Self {
        match Expression::from_wire(&raw) {
            Ok(expr) => Self::Parsed(expr),
            Err(e) => Self::Malformed {
                raw,
                error: e.to_string(),
            },
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

impl From<Expression> for RuleCondition {
    fn from(expr: Expression) -> Self {
        Self::Parsed(expr)
    }
}

impl Serialize for RuleCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Parsed(expr) => expr.serialize(serializer),
            Self::Malformed { raw, .. } => raw.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RuleCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_wire(Value::deserialize(deserializer)?))
    }
}

/// A business rule owned by exactly one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub gate_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: RuleCondition,
    /// Higher priority rules are evaluated first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// A failing critical rule overrides the score with the critical label.
    #[serde(default)]
    pub critical: bool,
}

fn default_weight() -> f64 {
    1.0
}

/// Order rules for evaluation: descending priority, ties by id.
pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

/// A score band mapped to a decision label when the pass threshold is missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRange {
    pub label: String,
    pub min_score: f64,
    pub max_score: f64,
    #[serde(default)]
    pub priority: i32,
}

impl FailRange {
    fn contains(&self, score: f64) -> bool {
        score >= self.min_score && score <= self.max_score
    }
}

/// Maps an aggregate score to a decision label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTable {
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_pass_label")]
    pub pass_label: String,
    #[serde(default = "default_critical_label")]
    pub critical_label: String,
    #[serde(default)]
    pub fail_ranges: Vec<FailRange>,
    #[serde(default = "default_fallback_label")]
    pub fallback_label: String,
}

impl Default for DecisionTable {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            pass_label: default_pass_label(),
            critical_label: default_critical_label(),
            fail_ranges: Vec::new(),
            fallback_label: default_fallback_label(),
        }
    }
}

fn default_pass_threshold() -> f64 {
    80.0
}

fn default_pass_label() -> String {
    "GO".to_string()
}

fn default_critical_label() -> String {
    "RECYCLE".to_string()
}

fn default_fallback_label() -> String {
    "RECYCLE".to_string()
}

impl DecisionTable {
    /// Every label this table can produce, pass label first.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = vec![self.pass_label.clone()];
        let others = std::iter::once(&self.critical_label)
            .chain(self.fail_ranges.iter().map(|r| &r.label))
            .chain(std::iter::once(&self.fallback_label));
        for label in others {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        labels
    }

    fn fail_label(&self, score: f64) -> &str {
        self.fail_ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.contains(score))
            // highest priority wins; declaration order breaks ties
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then_with(|| ib.cmp(ia)))
            .map(|(_, r)| r.label.as_str())
            .unwrap_or(self.fallback_label.as_str())
    }
}

/// The outcome of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub rule_name: String,
    pub passed: bool,
    /// 100 when passed, 0 otherwise.
    pub score: f64,
    pub weight: f64,
    pub critical: bool,
    pub reason: String,
    #[serde(default)]
    pub trace: Vec<TraceLeaf>,
}

/// A scored gate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvaluation {
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    pub gate_node_id: String,
    pub rule_results: Vec<RuleResult>,
    pub aggregate_score: f64,
    pub decision: String,
    pub reason: String,
    #[serde(default)]
    pub critical_failures: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateEvaluation {
    pub fn for_execution(mut self, id: &ExecutionId) -> Self {
        self.execution_id = Some(id.clone());
        self
    }

    pub fn passed(&self, table: &DecisionTable) -> bool {
        self.decision == table.pass_label && self.critical_failures.is_empty()
    }
}

/// Evaluate one rule against the context.
pub fn evaluate_rule(rule: &Rule, context: &Value) -> RuleResult {
    let (passed, reason, trace) = match &rule.condition {
        RuleCondition::Parsed(expr) => {
            let outcome = expr.evaluate(context);
            let reason = if outcome.passed {
                "condition met".to_string()
            } else {
                describe_failure(&outcome.trace)
            };
            (outcome.passed, reason, outcome.trace)
        }
        RuleCondition::Malformed { error, .. } => {
            (false, format!("malformed condition: {}", error), Vec::new())
        }
    };

    RuleResult {
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        passed,
        score: if passed { 100.0 } else { 0.0 },
        weight: rule.weight,
        critical: rule.critical,
        reason,
        trace,
    }
}

fn describe_failure(trace: &[TraceLeaf]) -> String {
    match trace.iter().rev().find(|leaf| !leaf.passed) {
        Some(leaf) => format!(
            "{} {} {} failed (actual: {})",
            leaf.field_path, leaf.operator, leaf.literal, leaf.resolved_value
        ),
        None => "condition not met".to_string(),
    }
}

/// Evaluate a gate's rules and pick a decision label.
pub fn evaluate_gate(
    gate_node_id: &str,
    rules: &[Rule],
    context: &Value,
    table: &DecisionTable,
) -> GateEvaluation {
    evaluate_gate_with(gate_node_id, rules, context, table, |_| {})
}

/// Like [`evaluate_gate`], reporting each rule result to `on_rule` as soon as
/// it is computed, in evaluation order.
pub fn evaluate_gate_with(
    gate_node_id: &str,
    rules: &[Rule],
    context: &Value,
    table: &DecisionTable,
    mut on_rule: impl FnMut(&RuleResult),
) -> GateEvaluation {
    if rules.is_empty() {
        return GateEvaluation {
            execution_id: None,
            gate_node_id: gate_node_id.to_string(),
            rule_results: Vec::new(),
            aggregate_score: 100.0,
            decision: table.pass_label.clone(),
            reason: "No rules configured, automatic pass".to_string(),
            critical_failures: Vec::new(),
            evaluated_at: Utc::now(),
        };
    }

    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    let mut results = Vec::with_capacity(ordered.len());
    for rule in ordered {
        let result = evaluate_rule(rule, context);
        on_rule(&result);
        results.push(result);
    }

    let aggregate_score = aggregate(&results);
    let failed_critical: Vec<&RuleResult> =
        results.iter().filter(|r| r.critical && !r.passed).collect();
    let critical_failures: Vec<String> =
        failed_critical.iter().map(|r| r.rule_id.clone()).collect();

    let (decision, reason) = if !failed_critical.is_empty() {
        let names: Vec<&str> = failed_critical.iter().map(|r| r.rule_name.as_str()).collect();
        (
            table.critical_label.clone(),
            format!("Critical rule(s) failed: {}", names.join(", ")),
        )
    } else if aggregate_score >= table.pass_threshold {
        (
            table.pass_label.clone(),
            format!(
                "Score {:.1} meets threshold {:.1}",
                aggregate_score, table.pass_threshold
            ),
        )
    } else {
        (
            table.fail_label(aggregate_score).to_string(),
            format!(
                "Score {:.1} below threshold {:.1}",
                aggregate_score, table.pass_threshold
            ),
        )
    };

    GateEvaluation {
        execution_id: None,
        gate_node_id: gate_node_id.to_string(),
        rule_results: results,
        aggregate_score,
        decision,
        reason,
        critical_failures,
        evaluated_at: Utc::now(),
    }
}

/// Weighted mean of rule scores, rounded to one decimal.
fn aggregate(results: &[RuleResult]) -> f64 {
    let total_weight: f64 = results.iter().map(|r| r.weight).sum();
    let raw = if total_weight > 0.0 {
        results.iter().map(|r| r.score * r.weight).sum::<f64>() / total_weight
    } else if results.iter().all(|r| r.passed) {
        100.0
    } else {
        0.0
    };
    (raw * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, cond: Value, weight: f64, critical: bool) -> Rule {
        Rule {
            id: id.to_string(),
            gate_id: "gate".to_string(),
            name: id.to_string(),
            description: None,
            condition: RuleCondition::from_wire(cond),
            priority: 0,
            weight,
            critical,
        }
    }

    #[test]
    fn test_weighted_score_below_threshold() {
        let ctx = json!({"a": 1, "b": 2, "c": 3});
        let rules = vec![
            rule("r1", json!({"field": "a", "operator": "==", "value": 1}), 1.0, false),
            rule("r2", json!({"field": "b", "operator": "==", "value": 2}), 2.0, false),
            rule("r3", json!({"field": "c", "operator": "==", "value": 0}), 1.0, false),
        ];
        let eval = evaluate_gate("gate", &rules, &ctx, &DecisionTable::default());
        assert_eq!(eval.aggregate_score, 75.0);
        assert_eq!(eval.decision, "RECYCLE");
        assert_eq!(eval.rule_results.len(), 3);
        assert!(eval.reason.contains("below threshold"));
    }

    #[test]
    fn test_pass_threshold_boundary_is_inclusive() {
        let ctx = json!({"a": 1, "b": 2, "c": 3, "d": 4});
        let rules = vec![
            rule("r1", json!({"field": "a", "operator": "==", "value": 1}), 1.0, false),
            rule("r2", json!({"field": "b", "operator": "==", "value": 2}), 1.0, false),
            rule("r3", json!({"field": "c", "operator": "==", "value": 3}), 1.0, false),
            rule("r4", json!({"field": "d", "operator": "==", "value": 0}), 1.0, false),
        ];
        let with_threshold = |pass_threshold: f64| DecisionTable {
            pass_threshold,
            ..Default::default()
        };

        let eval = evaluate_gate("gate", &rules, &ctx, &with_threshold(100.0));
        assert_eq!(eval.aggregate_score, 75.0);
        assert_eq!(eval.decision, "RECYCLE");

        for threshold in [75.0, 74.9, 50.0] {
            let eval = evaluate_gate("gate", &rules, &ctx, &with_threshold(threshold));
            assert_eq!(eval.decision, "GO", "threshold {}", threshold);
        }
        let eval = evaluate_gate("gate", &rules, &ctx, &with_threshold(75.1));
        assert_eq!(eval.decision, "RECYCLE");
    }

    #[test]
    fn test_critical_failures_name_rule_ids() {
        let ctx = json!({"country": "XX"});
        let mut blocked = rule(
            "not-blocked",
            json!({"field": "country", "operator": "!=", "value": "XX"}),
            1.0,
            true,
        );
        blocked.name = "Not on blocklist".to_string();
        let eval = evaluate_gate("gate", &[blocked], &ctx, &DecisionTable::default());
        assert_eq!(eval.critical_failures, vec!["not-blocked"]);
        assert!(eval.reason.contains("Not on blocklist"));
    }

    #[test]
    fn test_critical_failure_overrides_score() {
        let ctx = json!({"a": 1, "b": 2, "c": 3, "d": 4});
        let rules = vec![
            rule("r1", json!({"field": "a", "operator": "==", "value": 1}), 1.0, false),
            rule("r2", json!({"field": "b", "operator": "==", "value": 2}), 1.0, false),
            rule("r3", json!({"field": "c", "operator": "==", "value": 3}), 1.0, false),
            rule("r4", json!({"field": "d", "operator": "==", "value": 9}), 0.1, true),
        ];
        let table = DecisionTable {
            critical_label: "KILL".to_string(),
            ..Default::default()
        };
        let eval = evaluate_gate("gate", &rules, &ctx, &table);
        assert!(eval.aggregate_score >= table.pass_threshold);
        assert_eq!(eval.decision, "KILL");
        assert_eq!(eval.critical_failures, vec!["r4"]);
        // all rules still traced
        assert_eq!(eval.rule_results.len(), 4);
        assert!(eval.rule_results.iter().all(|r| !r.trace.is_empty()));
    }

    #[test]
    fn test_no_rules_is_automatic_pass() {
        let eval = evaluate_gate("gate", &[], &json!({}), &DecisionTable::default());
        assert_eq!(eval.aggregate_score, 100.0);
        assert_eq!(eval.decision, "GO");
    }

    #[test]
    fn test_fail_ranges_by_priority() {
        let table = DecisionTable {
            pass_threshold: 90.0,
            pass_label: "GO".to_string(),
            critical_label: "KILL".to_string(),
            fail_ranges: vec![
                FailRange { label: "HOLD".into(), min_score: 50.0, max_score: 89.9, priority: 1 },
                FailRange { label: "RECYCLE".into(), min_score: 60.0, max_score: 89.9, priority: 2 },
                FailRange { label: "KILL".into(), min_score: 0.0, max_score: 49.9, priority: 0 },
            ],
            fallback_label: "HOLD".to_string(),
        };
        let ctx = json!({"x": 1});
        let pass = rule("p", json!({"field": "x", "operator": "==", "value": 1}), 2.0, false);
        let fail = rule("f", json!({"field": "x", "operator": "==", "value": 2}), 1.0, false);

        let eval = evaluate_gate("gate", &[pass.clone(), fail.clone()], &ctx, &table);
        assert_eq!(eval.aggregate_score, 66.7);
        assert_eq!(eval.decision, "RECYCLE");

        let eval = evaluate_gate("gate", &[fail], &ctx, &table);
        assert_eq!(eval.aggregate_score, 0.0);
        assert_eq!(eval.decision, "KILL");
        assert_eq!(table.labels(), vec!["GO", "KILL", "HOLD", "RECYCLE"]);
    }

    #[test]
    fn test_malformed_condition_fails_rule() {
        let ctx = json!({"x": 1});
        let rules = vec![
            rule("ok", json!({"field": "x", "operator": "==", "value": 1}), 1.0, false),
            rule("bad", json!({"field": "x", "operator": "~~"}), 1.0, false),
        ];
        assert!(rules[1].condition.is_malformed());
        let eval = evaluate_gate("gate", &rules, &ctx, &DecisionTable::default());
        let bad = eval.rule_results.iter().find(|r| r.rule_id == "bad").unwrap();
        assert!(!bad.passed);
        assert!(bad.reason.contains("malformed condition"));
        assert_eq!(eval.aggregate_score, 50.0);
    }

    #[test]
    fn test_observer_sees_priority_order() {
        let ctx = json!({});
        let mut low = rule("a-low", json!({"field": "x", "operator": "IS NULL"}), 1.0, false);
        low.priority = 1;
        let mut high = rule("z-high", json!({"field": "x", "operator": "IS NULL"}), 1.0, false);
        high.priority = 10;
        let mut tie = rule("b-low", json!({"field": "x", "operator": "IS NULL"}), 1.0, false);
        tie.priority = 1;

        let mut seen = Vec::new();
        let eval = evaluate_gate_with(
            "gate",
            &[low, high, tie],
            &ctx,
            &DecisionTable::default(),
            |r| seen.push(r.rule_id.clone()),
        );
        assert_eq!(seen, vec!["z-high", "a-low", "b-low"]);
        assert_eq!(eval.decision, "GO");
    }

    #[test]
    fn test_gate_evaluation_serde_roundtrip() {
        let ctx = json!({"amount": 500});
        let rules = vec![rule(
            "r1",
            json!({"field": "amount", "operator": "<", "value": 1000}),
            1.0,
            false,
        )];
        let eval = evaluate_gate("gate", &rules, &ctx, &DecisionTable::default())
            .for_execution(&ExecutionId::from_string("exec-1"));
        let json = serde_json::to_string(&eval).unwrap();
        let back: GateEvaluation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, eval);
        assert!(back.passed(&DecisionTable::default()));
    }
}
