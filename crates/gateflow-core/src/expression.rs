//! Condition evaluator: a typed expression tree evaluated against a JSON context.
//!
//! Conditions arrive in the wire format produced by flow builders and are
//! parsed once (`Expression::from_wire`) when the flow tree is built, so the
//! evaluator itself never interprets untyped structures. Evaluation is pure:
//! the same expression and context always produce the same result and trace.
//!
//! Wire shapes:
//! - `{"field": "a.b", "operator": ">=", "value": 18}`
//! - `{"AND": [..]}`, `{"OR": [..]}`, `{"NOT": {..}}`
//! - `{"IN": "a.b", "values": [..]}`, `{"NOT IN": "a.b", "values": [..]}`
//! - `{"MATCHES": {"field": "a.b", "pattern": "^x"}}`
//! - `{"CONTAINS": {"field": "a.b", "value": "x"}}`

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::{GateflowError, Result};

/// Comparison operators usable in a `{"field", "operator", "value"}` leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            "IS NULL" => Some(Self::IsNull),
            "IS NOT NULL" => Some(Self::IsNotNull),
            _ => None,
        }
    }

    fn takes_literal(&self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl LogicalOp {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOp {
    In,
    NotIn,
}

impl MembershipOp {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }
}

/// A compiled regex that keeps its source pattern for traces and the wire.
///
/// Patterns are anchored at the start of the value (a prefix match), the
/// same way the rule language has always matched.
#[derive(Clone)]
pub struct MatchPattern {
    source: String,
    regex: Regex,
}

impl MatchPattern {
    pub fn new(source: &str) -> Result<Self> {
        let regex = Regex::new(&format!(r"\A(?:{})", source)).map_err(|e| {
            GateflowError::RuleEvaluation(format!("invalid pattern '{}': {}", source, e))
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl fmt::Debug for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MatchPattern({:?})", self.source)
    }
}

impl PartialEq for MatchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// A typed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Comparison {
        field: String,
        op: CompareOp,
        literal: Value,
    },
    Logical {
        op: LogicalOp,
        children: Vec<Expression>,
    },
    Pattern {
        field: String,
        pattern: MatchPattern,
    },
    Membership {
        field: String,
        op: MembershipOp,
        values: Vec<Value>,
    },
    Contains {
        field: String,
        value: Value,
    },
}

/// One evaluated leaf of an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceLeaf {
    pub field_path: String,
    pub resolved_value: Value,
    pub operator: String,
    pub literal: Value,
    pub passed: bool,
}

/// Result of evaluating an expression: the boolean plus the leaves that were
/// actually evaluated (short-circuited leaves are absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionOutcome {
    pub passed: bool,
    pub trace: Vec<TraceLeaf>,
}

impl Expression {
    pub fn compare(field: impl Into<String>, op: CompareOp, literal: Value) -> Self {
        Self::Comparison {
            field: field.into(),
            op,
            literal,
        }
    }

    pub fn all(children: Vec<Expression>) -> Self {
        Self::Logical {
            op: LogicalOp::And,
            children,
        }
    }

    pub fn any(children: Vec<Expression>) -> Self {
        Self::Logical {
            op: LogicalOp::Or,
            children,
        }
    }

    pub fn negate(child: Expression) -> Self {
        Self::Logical {
            op: LogicalOp::Not,
            children: vec![child],
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::Membership {
            field: field.into(),
            op: MembershipOp::In,
            values,
        }
    }

    pub fn matches(field: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self::Pattern {
            field: field.into(),
            pattern: MatchPattern::new(pattern)?,
        })
    }

    /// Parse the wire format into a typed expression.
    pub fn from_wire(node: &Value) -> Result<Self> {
        let obj = node.as_object().ok_or_else(|| {
            malformed(format!("expression node must be an object, got {}", node))
        })?;

        if let Some(children) = obj.get("AND") {
            return Ok(Self::all(parse_children("AND", children)?));
        }
        if let Some(children) = obj.get("OR") {
            return Ok(Self::any(parse_children("OR", children)?));
        }
        if let Some(child) = obj.get("NOT") {
            let child = match child {
                Value::Array(items) if items.len() == 1 => &items[0],
                Value::Array(_) => return Err(malformed("NOT takes exactly one condition")),
                other => other,
            };
            return Ok(Self::negate(Self::from_wire(child)?));
        }
        if let Some(field) = obj.get("NOT IN") {
            return parse_membership(MembershipOp::NotIn, field, obj.get("values"));
        }
        if let Some(field) = obj.get("IN") {
            return parse_membership(MembershipOp::In, field, obj.get("values"));
        }
        if let Some(spec) = obj.get("MATCHES") {
            let field = str_field(spec, "field", "MATCHES")?;
            let pattern = str_field(spec, "pattern", "MATCHES")?;
            return Self::matches(field, &pattern);
        }
        if let Some(spec) = obj.get("CONTAINS") {
            let field = str_field(spec, "field", "CONTAINS")?;
            let value = spec
                .get("value")
                .cloned()
                .ok_or_else(|| malformed("CONTAINS requires 'value'"))?;
            return Ok(Self::Contains { field, value });
        }
        if let Some(field) = obj.get("field") {
            return parse_leaf(field, obj.get("operator"), obj.get("value"));
        }

        Err(malformed(format!("unknown expression node: {}", node)))
    }

    /// Serialize back into the wire format.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Comparison { field, op, literal } => {
                if op.takes_literal() {
                    json!({ "field": field, "operator": op.symbol(), "value": literal })
                } else {
                    json!({ "field": field, "operator": op.symbol() })
                }
            }
            Self::Logical {
                op: LogicalOp::Not,
                children,
            } => {
                let child = children.first().map(|c| c.to_wire()).unwrap_or(Value::Null);
                json!({ "NOT": child })
            }
            Self::Logical { op, children } => {
                let items: Vec<Value> = children.iter().map(|c| c.to_wire()).collect();
                json!({ op.keyword(): items })
            }
            Self::Pattern { field, pattern } => {
                json!({ "MATCHES": { "field": field, "pattern": pattern.as_str() } })
            }
            Self::Membership { field, op, values } => {
                json!({ op.keyword(): field, "values": values })
            }
            Self::Contains { field, value } => {
                json!({ "CONTAINS": { "field": field, "value": value } })
            }
        }
    }

    /// Every field path the expression reads, in tree order.
    pub fn field_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Comparison { field, .. }
            | Self::Pattern { field, .. }
            | Self::Membership { field, .. }
            | Self::Contains { field, .. } => {
                if !out.contains(&field.as_str()) {
                    out.push(field);
                }
            }
            Self::Logical { children, .. } => {
                for child in children {
                    child.collect_fields(out);
                }
            }
        }
    }

    /// Evaluate against a context.
    pub fn evaluate(&self, context: &Value) -> ConditionOutcome {
        let mut trace = Vec::new();
        let passed = self.eval_node(context, &mut trace);
        ConditionOutcome { passed, trace }
    }

    fn eval_node(&self, context: &Value, trace: &mut Vec<TraceLeaf>) -> bool {
        match self {
            Self::Logical {
                op: LogicalOp::And,
                children,
            } => {
                for child in children {
                    if !child.eval_node(context, trace) {
                        return false;
                    }
                }
                true
            }
            Self::Logical {
                op: LogicalOp::Or,
                children,
            } => {
                for child in children {
                    if child.eval_node(context, trace) {
                        return true;
                    }
                }
                false
            }
            Self::Logical {
                op: LogicalOp::Not,
                children,
            } => !children
                .first()
                .map(|c| c.eval_node(context, trace))
                .unwrap_or(false),
            Self::Comparison { field, op, literal } => {
                let actual = resolve_field(field, context);
                let passed = compare(&actual, *op, literal);
                trace.push(leaf(field, actual, op.symbol(), literal.clone(), passed));
                passed
            }
            Self::Pattern { field, pattern } => {
                let actual = resolve_field(field, context);
                let passed = actual.as_str().is_some_and(|s| pattern.is_match(s));
                trace.push(leaf(
                    field,
                    actual,
                    "MATCHES",
                    Value::String(pattern.as_str().to_string()),
                    passed,
                ));
                passed
            }
            Self::Membership { field, op, values } => {
                let actual = resolve_field(field, context);
                let passed = if actual.is_null() {
                    false
                } else {
                    let found = values
                        .iter()
                        .any(|v| loose_equals(&actual, v).unwrap_or(false));
                    match op {
                        MembershipOp::In => found,
                        MembershipOp::NotIn => !found,
                    }
                };
                trace.push(leaf(
                    field,
                    actual,
                    op.keyword(),
                    Value::Array(values.clone()),
                    passed,
                ));
                passed
            }
            Self::Contains { field, value } => {
                let actual = resolve_field(field, context);
                let passed = match (&actual, value) {
                    (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
                    (Value::Array(items), needle) => items
                        .iter()
                        .any(|item| loose_equals(item, needle).unwrap_or(false)),
                    _ => false,
                };
                trace.push(leaf(field, actual, "CONTAINS", value.clone(), passed));
                passed
            }
        }
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Expression::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

/// Evaluate `expression` against `context`.
pub fn evaluate(expression: &Expression, context: &Value) -> ConditionOutcome {
    expression.evaluate(context)
}

/// Resolve a dot-separated path against the context.
///
/// Numeric segments (and `name[3]` segments) index into arrays. A trailing
/// `.length` yields the element count of the array/object (or the character
/// count of a string) at the prefix. Anything unresolvable yields `Null`.
pub fn resolve_field(path: &str, context: &Value) -> Value {
    if let Some(prefix) = path.strip_suffix(".length") {
        return match lookup(prefix, context) {
            Some(Value::Array(items)) => Value::from(items.len()),
            Some(Value::Object(map)) => Value::from(map.len()),
            Some(Value::String(s)) => Value::from(s.chars().count()),
            _ => Value::Null,
        };
    }
    lookup(path, context).cloned().unwrap_or(Value::Null)
}

fn lookup<'a>(path: &str, context: &'a Value) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        let (key, indices) = split_indices(segment)?;
        if !key.is_empty() {
            current = step(current, key)?;
        }
        for index in indices {
            current = current.as_array()?.get(index)?;
        }
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn step<'a>(current: &'a Value, key: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Split `items[0][1]` into `("items", [0, 1])`.
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let key = &segment[..open];
    let mut indices = Vec::new();
    for part in segment[open..].split('[').skip(1) {
        let idx = part.strip_suffix(']')?.trim().parse::<usize>().ok()?;
        indices.push(idx);
    }
    Some((key, indices))
}

/// Apply a comparison operator. Incompatible kinds never raise: they compare
/// as `false`, and a missing value (null) only satisfies `IS NULL`.
pub fn compare(actual: &Value, op: CompareOp, literal: &Value) -> bool {
    match op {
        CompareOp::IsNull => actual.is_null(),
        CompareOp::IsNotNull => !actual.is_null(),
        _ if actual.is_null() || literal.is_null() => false,
        CompareOp::Eq => loose_equals(actual, literal).unwrap_or(false),
        CompareOp::Ne => loose_equals(actual, literal).map(|eq| !eq).unwrap_or(false),
        CompareOp::Gt => ordering(actual, literal) == Some(Ordering::Greater),
        CompareOp::Lt => ordering(actual, literal) == Some(Ordering::Less),
        CompareOp::Ge => matches!(
            ordering(actual, literal),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Le => matches!(
            ordering(actual, literal),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// Equality with numeric coercion. `None` means the kinds cannot be compared.
fn loose_equals(actual: &Value, literal: &Value) -> Option<bool> {
    if let Some(ord) = numeric_ordering(actual, literal) {
        return Some(ord == Ordering::Equal);
    }
    match (actual, literal) {
        (Value::String(a), Value::String(b)) => Some(a == b),
        (Value::Bool(a), Value::Bool(b)) => Some(a == b),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            Some(actual == literal)
        }
        _ => None,
    }
}

fn ordering(actual: &Value, literal: &Value) -> Option<Ordering> {
    if let Some(ord) = numeric_ordering(actual, literal) {
        return Some(ord);
    }
    match (actual, literal) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Numeric comparison when at least one side is a number and the other is a
/// number or a numeric-looking string.
fn numeric_ordering(actual: &Value, literal: &Value) -> Option<Ordering> {
    if !actual.is_number() && !literal.is_number() {
        return None;
    }
    if let Some(ord) = integer_ordering(actual, literal) {
        return Some(ord);
    }
    let a = as_number(actual)?;
    let b = as_number(literal)?;
    a.partial_cmp(&b)
}

/// Exact ordering when both sides are JSON integers; `f64` loses precision
/// past 2^53.
fn integer_ordering(actual: &Value, literal: &Value) -> Option<Ordering> {
    let (Value::Number(a), Value::Number(b)) = (actual, literal) else {
        return None;
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return Some(a.cmp(&b));
    }
    // one side is negative, the other above i64::MAX
    match (a.as_i64(), b.as_u64()) {
        (Some(_), Some(_)) => Some(Ordering::Less),
        _ => match (a.as_u64(), b.as_i64()) {
            (Some(_), Some(_)) => Some(Ordering::Greater),
            _ => None,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn leaf(field: &str, actual: Value, op: &str, literal: Value, passed: bool) -> TraceLeaf {
    TraceLeaf {
        field_path: field.to_string(),
        resolved_value: actual,
        operator: op.to_string(),
        literal,
        passed,
    }
}

fn malformed(msg: impl Into<String>) -> GateflowError {
    GateflowError::RuleEvaluation(msg.into())
}

fn parse_children(keyword: &str, children: &Value) -> Result<Vec<Expression>> {
    let items = children
        .as_array()
        .ok_or_else(|| malformed(format!("{} operator requires a list of conditions", keyword)))?;
    items.iter().map(Expression::from_wire).collect()
}

fn parse_membership(op: MembershipOp, field: &Value, values: Option<&Value>) -> Result<Expression> {
    let field = field
        .as_str()
        .ok_or_else(|| malformed(format!("{} requires a field path string", op.keyword())))?;
    let values = values
        .and_then(|v| v.as_array())
        .ok_or_else(|| malformed(format!("{} requires a 'values' list", op.keyword())))?;
    Ok(Expression::Membership {
        field: field.to_string(),
        op,
        values: values.clone(),
    })
}

fn parse_leaf(field: &Value, operator: Option<&Value>, value: Option<&Value>) -> Result<Expression> {
    let field = field
        .as_str()
        .ok_or_else(|| malformed("'field' must be a string"))?
        .to_string();
    let operator = operator
        .and_then(|o| o.as_str())
        .ok_or_else(|| malformed(format!("comparison on '{}' requires 'operator'", field)))?;

    // The leaf form can also carry the keyword operators.
    match operator.trim() {
        "IN" | "NOT IN" => {
            let op = if operator.trim() == "IN" {
                MembershipOp::In
            } else {
                MembershipOp::NotIn
            };
            return parse_membership(op, &Value::String(field), value);
        }
        "MATCHES" => {
            let pattern = value
                .and_then(|v| v.as_str())
                .ok_or_else(|| malformed("MATCHES requires a string pattern"))?;
            return Expression::matches(field, pattern);
        }
        "CONTAINS" => {
            let value = value
                .cloned()
                .ok_or_else(|| malformed("CONTAINS requires 'value'"))?;
            return Ok(Expression::Contains { field, value });
        }
        _ => {}
    }

    let op = CompareOp::parse(operator)
        .ok_or_else(|| malformed(format!("unknown operator: {}", operator)))?;
    let literal = match (op.takes_literal(), value) {
        (true, Some(v)) => v.clone(),
        (true, None) => {
            return Err(malformed(format!(
                "comparison on '{}' with '{}' requires 'value'",
                field,
                op.symbol()
            )))
        }
        (false, _) => Value::Null,
    };
    Ok(Expression::Comparison { field, op, literal })
}

fn str_field(spec: &Value, key: &str, keyword: &str) -> Result<String> {
    spec.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| malformed(format!("{} requires '{}'", keyword, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(v: Value) -> Expression {
        Expression::from_wire(&v).unwrap()
    }

    #[test]
    fn test_length_resolution() {
        let ctx = json!({"a": {"b": [1, 2, 3]}});
        assert_eq!(resolve_field("a.b.length", &ctx), json!(3));
        assert_eq!(resolve_field("a.length", &ctx), json!(1));

        let expr = parse(json!({"field": "a.b.length", "operator": "==", "value": 3}));
        assert!(expr.evaluate(&ctx).passed);
    }

    #[test]
    fn test_missing_path_only_matches_is_null() {
        let ctx = json!({"a": {"b": 1}});
        assert_eq!(resolve_field("a.x.y", &ctx), Value::Null);
        assert_eq!(resolve_field("a.b.c", &ctx), Value::Null);

        for op in ["==", "!=", ">", "<", ">=", "<="] {
            let expr = parse(json!({"field": "a.missing", "operator": op, "value": 1}));
            assert!(!expr.evaluate(&ctx).passed, "operator {} matched null", op);
        }
        assert!(parse(json!({"field": "a.missing", "operator": "IS NULL"}))
            .evaluate(&ctx)
            .passed);
        assert!(!parse(json!({"field": "a.missing", "operator": "IS NOT NULL"}))
            .evaluate(&ctx)
            .passed);
        assert!(!parse(json!({"IN": "a.missing", "values": [1]}))
            .evaluate(&ctx)
            .passed);
    }

    #[test]
    fn test_array_indexing() {
        let ctx = json!({"items": [{"id": "x"}, {"id": "y"}]});
        assert_eq!(resolve_field("items.1.id", &ctx), json!("y"));
        assert_eq!(resolve_field("items[0].id", &ctx), json!("x"));
        assert_eq!(resolve_field("items[5].id", &ctx), Value::Null);
    }

    #[test]
    fn test_numeric_and_lexicographic_comparisons() {
        let ctx = json!({"age": 25, "score": 7.5, "name": "bob", "count": "12"});
        assert!(compare(&ctx["age"], CompareOp::Ge, &json!(18)));
        assert!(compare(&ctx["score"], CompareOp::Lt, &json!(8)));
        assert!(compare(&ctx["name"], CompareOp::Gt, &json!("alice")));
        // numeric-looking string coerces against a numeric literal
        assert!(compare(&ctx["count"], CompareOp::Gt, &json!(10)));
        assert!(compare(&json!(25), CompareOp::Eq, &json!(25.0)));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = json!(9007199254740993u64);
        assert!(!compare(&big, CompareOp::Eq, &json!(9007199254740992u64)));
        assert!(compare(&big, CompareOp::Gt, &json!(9007199254740992u64)));
        assert!(compare(&json!(u64::MAX), CompareOp::Gt, &json!(-1)));
        assert!(compare(&json!(i64::MIN), CompareOp::Lt, &json!(u64::MAX)));
        assert!(compare(&json!(3), CompareOp::Lt, &json!(3.5)));
    }

    #[test]
    fn test_incoercible_comparison_is_false() {
        let word = json!("abc");
        assert!(!compare(&word, CompareOp::Gt, &json!(1)));
        assert!(!compare(&word, CompareOp::Eq, &json!(1)));
        assert!(!compare(&word, CompareOp::Ne, &json!(1)));
        assert!(!compare(&json!(true), CompareOp::Gt, &json!(false)));
        assert!(!compare(&json!([1]), CompareOp::Lt, &json!(2)));
    }

    #[test]
    fn test_logical_short_circuit_trace() {
        let ctx = json!({"status": "inactive", "balance": 10});
        let expr = parse(json!({
            "AND": [
                {"field": "status", "operator": "==", "value": "active"},
                {"field": "balance", "operator": ">", "value": 0}
            ]
        }));
        let out = expr.evaluate(&ctx);
        assert!(!out.passed);
        // only the decisive leaf was evaluated
        assert_eq!(out.trace.len(), 1);
        assert_eq!(out.trace[0].field_path, "status");
        assert_eq!(out.trace[0].resolved_value, json!("inactive"));
        assert!(!out.trace[0].passed);

        let expr = parse(json!({
            "OR": [
                {"field": "balance", "operator": ">", "value": 0},
                {"field": "status", "operator": "==", "value": "active"}
            ]
        }));
        let out = expr.evaluate(&ctx);
        assert!(out.passed);
        assert_eq!(out.trace.len(), 1);

        let expr = parse(json!({"NOT": {"field": "balance", "operator": ">", "value": 100}}));
        assert!(expr.evaluate(&ctx).passed);
    }

    #[test]
    fn test_membership_and_contains() {
        let ctx = json!({"tier": "gold", "tags": ["a", "b"], "text": "hello world"});
        assert!(parse(json!({"IN": "tier", "values": ["gold", "platinum"]}))
            .evaluate(&ctx)
            .passed);
        assert!(parse(json!({"NOT IN": "tier", "values": ["bronze"]}))
            .evaluate(&ctx)
            .passed);
        assert!(parse(json!({"field": "tier", "operator": "IN", "value": ["gold"]}))
            .evaluate(&ctx)
            .passed);
        assert!(parse(json!({"CONTAINS": {"field": "text", "value": "world"}}))
            .evaluate(&ctx)
            .passed);
        assert!(parse(json!({"CONTAINS": {"field": "tags", "value": "b"}}))
            .evaluate(&ctx)
            .passed);
    }

    #[test]
    fn test_pattern_match() {
        let ctx = json!({"email": "dev@example.com", "age": 30});
        let email = parse(json!({
            "MATCHES": {"field": "email", "pattern": r"[a-z]+@[a-z]+\.com"}
        }));
        assert!(email.evaluate(&ctx).passed);

        // non-string fields never match
        let age = parse(json!({"MATCHES": {"field": "age", "pattern": "3"}}));
        assert!(!age.evaluate(&ctx).passed);

        // anchored at the start of the value
        let mid = parse(json!({"MATCHES": {"field": "email", "pattern": "example"}}));
        assert!(!mid.evaluate(&ctx).passed);
    }

    #[test]
    fn test_malformed_wire_rejected() {
        let cases = vec![
            json!("not an object"),
            json!({"field": "a"}),
            json!({"field": "a", "operator": "~=", "value": 1}),
            json!({"field": "a", "operator": ">"}),
            json!({"AND": {"field": "a"}}),
            json!({"MATCHES": {"field": "a", "pattern": "("}}),
            json!({"IN": "a"}),
            json!({"bogus": true}),
        ];
        for case in cases {
            assert!(
                matches!(Expression::from_wire(&case), Err(GateflowError::RuleEvaluation(_))),
                "accepted malformed {}",
                case
            );
        }
    }

    #[test]
    fn test_wire_roundtrip_preserves_meaning() {
        let wire = json!({
            "OR": [
                {"field": "user.tier", "operator": "==", "value": "premium"},
                {"AND": [
                    {"field": "tx.amount", "operator": ">", "value": 1000},
                    {"field": "tx.verified", "operator": "IS NOT NULL"}
                ]},
                {"NOT": {"IN": "user.status", "values": ["banned"]}},
                {"MATCHES": {"field": "user.email", "pattern": ".+@.+"}}
            ]
        });
        let expr = parse(wire.clone());
        assert_eq!(expr.to_wire(), wire);

        let serialized = serde_json::to_string(&expr).unwrap();
        let back: Expression = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn test_deterministic_evaluation() {
        let ctx = json!({"a": {"b": [1, 2]}, "s": "x"});
        let expr = parse(json!({
            "AND": [
                {"field": "a.b.length", "operator": ">=", "value": 2},
                {"OR": [
                    {"field": "s", "operator": "==", "value": "y"},
                    {"field": "missing", "operator": "IS NULL"}
                ]}
            ]
        }));
        let first = expr.evaluate(&ctx);
        for _ in 0..10 {
            assert_eq!(expr.evaluate(&ctx), first);
        }
        assert!(first.passed);
        assert_eq!(first.trace.len(), 3);
    }

    #[test]
    fn test_field_paths() {
        let expr = parse(json!({
            "AND": [
                {"field": "a", "operator": "==", "value": 1},
                {"field": "b.c", "operator": "IS NULL"},
                {"field": "a", "operator": ">", "value": 0}
            ]
        }));
        assert_eq!(expr.field_paths(), vec!["a", "b.c"]);
    }
}
