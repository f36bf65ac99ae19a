use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use gateflow_core::traits::FlowStore;
use gateflow_core::tree::{FlowDefinition, FlowTree};
use gateflow_core::types::{AuditEventType, ExecutionStatus, NodeStatus};
use gateflow_engine::FlowExecutor;
use gateflow_store::SqliteFlowStore;
use gateflow_test_utils::{temp_store, Reply, ScriptedAgent, ScriptedApprover};

const LOAN_FLOW: &str = r#"
flow_id = "loan"
name = "Loan approval"

[[nodes]]
id = "root"
type = "root"

[[nodes]]
id = "score"
type = "agent"
parent_id = "root"
order_index = 0
config = { goal = "score the applicant", input_keys = ["applicant"], output_keys = ["credit"], max_retries = 1 }

[[nodes]]
id = "check"
type = "gate"
parent_id = "root"
order_index = 1
config = { pass_threshold = 100.0, actions = { RECYCLE = { action = "recycle", target = "score" } } }

[[nodes]]
id = "signoff"
type = "gate"
parent_id = "check"
config = { kind = "human", approvers = ["credit-officer"] }

[[nodes]]
id = "disburse"
type = "agent"
parent_id = "signoff"
config = { goal = "disburse funds", input_keys = ["credit"] }

[[rules]]
id = "min-score"
gate_id = "check"
name = "Minimum score"
condition = { field = "credit.score", operator = ">=", value = 650 }

[[rules]]
id = "not-blocked"
gate_id = "check"
name = "Not on blocklist"
critical = true
condition = { NOT = { IN = "applicant.country", values = ["XX", "YY"] } }
"#;

fn loan_tree() -> Arc<FlowTree> {
    let definition = FlowDefinition::from_toml_str(LOAN_FLOW).expect("parse flow");
    Arc::new(FlowTree::build(definition).expect("build flow"))
}

#[tokio::test]
async fn test_loan_flow_end_to_end_with_recycle_and_signoff() {
    let (store, dir) = temp_store();
    let agent = Arc::new(
        ScriptedAgent::new("scorer")
            .on_node(
                "score",
                vec![
                    Reply::error("bureau offline"),
                    Reply::ok(json!({"credit": {"score": 610}})),
                    Reply::ok(json!({"credit": {"score": 700}})),
                ],
            )
            .on_node("disburse", vec![Reply::ok(json!({"transfer": "tx-1"}))]),
    );
    let flow_path = dir.path().join("loan.toml");
    std::fs::write(&flow_path, LOAN_FLOW).unwrap();
    let definition = FlowDefinition::load(&flow_path).expect("load flow file");
    store.save_flow(&definition).unwrap();
    let tree = Arc::new(FlowTree::build(definition).expect("build flow"));

    let approver = Arc::new(ScriptedApprover::new("officer-7", &["GO"]));
    let executor = FlowExecutor::new(tree, agent.clone(), store.clone())
        .with_human(approver.clone());

    let report = executor
        .execute(
            json!({"applicant": {"name": "Ada", "country": "NL"}}),
            CancellationToken::new(),
        )
        .await
        .expect("execute");

    assert_eq!(report.status, ExecutionStatus::Completed, "{:?}", report.reason);
    // one failed attempt plus a retry, then one recycle
    assert_eq!(agent.calls_for("score"), 3);
    assert_eq!(agent.calls_for("disburse"), 1);
    assert_eq!(report.memory["credit"]["score"], 700);
    assert_eq!(report.events(AuditEventType::RecycleTriggered).len(), 1);
    assert_eq!(approver.requests().len(), 1);
    assert_eq!(approver.requests()[0].gate_node_id, "signoff");

    // everything survives a reopen of the database file
    drop(executor);
    drop(store);
    let reopened = SqliteFlowStore::open(&dir.path().join("gateflow.db")).expect("reopen");
    let flow = reopened.load_flow("loan").unwrap().expect("flow persisted");
    assert_eq!(flow.rules.len(), 2);
    let execution = reopened
        .get_execution(&report.execution_id)
        .unwrap()
        .expect("execution persisted");
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let trail = reopened.audit_trail(&report.execution_id).unwrap();
    assert_eq!(trail.len(), report.audit.len());
    assert!(trail.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));

    let gates = reopened.gate_evaluations(&report.execution_id).unwrap();
    let decisions: Vec<&str> = gates.iter().map(|g| g.decision.as_str()).collect();
    assert_eq!(decisions, vec!["RECYCLE", "GO", "GO"]);

    let nodes = reopened.node_executions(&report.execution_id).unwrap();
    assert!(nodes
        .iter()
        .all(|n| n.status == NodeStatus::Completed || n.node_id == "score"));
    let memory = reopened.load_working_memory(&report.execution_id).unwrap();
    assert_eq!(memory["credit"]["score"], 700);
    assert_eq!(memory["node_score_result"]["credit"]["score"], 700);

    let assignments = reopened.assignments(&report.execution_id).unwrap();
    assert_eq!(assignments.len(), 4);
    assert_eq!(assignments.iter().filter(|a| a.node_id == "score").count(), 3);
    let stats = reopened.agent_performance(None).unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].agent_id, "scorer");
    assert_eq!(stats[0].total_assignments, 4);
    assert_eq!(stats[0].successful, 3);
}

#[tokio::test]
async fn test_blocklisted_applicant_hits_critical_rule() {
    let (store, _dir) = temp_store();
    let agent = Arc::new(
        ScriptedAgent::new("scorer")
            .on_node("score", vec![Reply::ok(json!({"credit": {"score": 800}}))]),
    );
    let executor = FlowExecutor::new(loan_tree(), agent.clone(), store.clone())
        .with_human(Arc::new(ScriptedApprover::new("officer", &["GO"])));

    let report = executor
        .execute(
            json!({"applicant": {"name": "Bob", "country": "XX"}}),
            CancellationToken::new(),
        )
        .await
        .expect("execute");

    // the critical label recycles; the score never changes, so recycles run out
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(agent.calls_for("disburse"), 0);
    let decided = report.events(AuditEventType::GateDecided);
    assert!(decided.iter().all(|e| e.payload["decision"] == "RECYCLE"));
    assert_eq!(decided[0].payload["critical_failures"], json!(["not-blocked"]));
    assert_eq!(report.events(AuditEventType::RecycleTriggered).len(), 3);
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_agents_drive_a_flow() {
    use gateflow_core::config::AgentEntry;
    use gateflow_engine::{AgentRegistry, CommandAgent};

    let entry = AgentEntry {
        id: "bureau".into(),
        name: None,
        tags: vec!["credit".into()],
        command: "sh".into(),
        args: vec![
            "-c".into(),
            r#"cat > /dev/null; echo '{"output": {"credit": {"score": 720}}}'"#.into(),
        ],
        env: Default::default(),
        timeout_secs: 10,
    };
    let registry = AgentRegistry::new().with(Arc::new(CommandAgent::from_entry(&entry)));

    let definition = FlowDefinition::from_json_str(
        &json!({
            "flow_id": "bureau-check",
            "name": "Bureau check",
            "nodes": [
                {"id": "root", "type": "root"},
                {"id": "score", "type": "agent", "parent_id": "root",
                 "config": {"goal": "score", "output_keys": ["credit"], "required_tags": ["credit"]}},
                {"id": "check", "type": "gate", "parent_id": "root", "order_index": 1, "config": {}}
            ],
            "rules": [
                {"id": "min", "gate_id": "check", "name": "min",
                 "condition": {"field": "credit.score", "operator": ">", "value": 650}}
            ]
        })
        .to_string(),
    )
    .expect("parse flow");

    let store = Arc::new(SqliteFlowStore::in_memory().unwrap());
    let executor = FlowExecutor::new(
        Arc::new(FlowTree::build(definition).unwrap()),
        Arc::new(registry),
        store,
    );
    let report = executor
        .execute(json!({}), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed, "{:?}", report.reason);
    assert_eq!(report.memory["credit"]["score"], 720);
    let attempts = report.events(AuditEventType::AgentAttempt);
    assert_eq!(attempts[0].actor.to_string(), "agent:bureau");
}
