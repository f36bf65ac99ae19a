use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use gateflow_core::config::AgentEntry;
use gateflow_core::error::{GateflowError, Result};
use gateflow_core::traits::AgentCollaborator;
use gateflow_core::types::{AgentOutcome, AgentTask};

/// Agent collaborator backed by an external process.
///
/// The task is written to the child's stdin as one JSON document; the child
/// answers with `{"output": .., "success": .., "metadata": ..}` on stdout. A
/// stdout that is not such an object is taken as a successful plain output.
pub struct CommandAgent {
    id: String,
    tags: Vec<String>,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: vec![],
            command: command.into(),
            args: vec![],
            env: HashMap::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn from_entry(entry: &AgentEntry) -> Self {
        Self {
            id: entry.id.clone(),
            tags: entry.tags.clone(),
            command: entry.command.clone(),
            args: entry.args.clone(),
            env: entry.env.clone(),
            timeout: Duration::from_secs(entry.timeout_secs),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, task: AgentTask) -> Result<AgentOutcome> {
        let node = task.node_id.clone();
        let delegation = |message: String| GateflowError::AgentDelegation {
            node: node.clone(),
            message,
        };
        let payload = serde_json::to_vec(&task)?;

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| delegation(format!("failed to spawn '{}': {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // the agent may exit without reading its task
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(agent_id = %self.id, "Agent closed stdin early");
                }
                Err(e) => return Err(delegation(format!("failed to write task: {}", e))),
            }
            // closing stdin signals end of task
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| delegation(e.to_string()))?,
            Err(_) => {
                return Err(GateflowError::AgentTimeout {
                    node: task.node_id,
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(agent_id = %self.id, stderr = %stderr.trim(), "Agent stderr");
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(agent_id = %self.id, code, "Agent process failed");
            return Err(delegation(format!(
                "process exited with code {}: {}",
                code,
                stderr.trim()
            )));
        }

        Ok(parse_outcome(stdout.trim()))
    }
}

fn parse_outcome(stdout: &str) -> AgentOutcome {
    match serde_json::from_str::<serde_json::Value>(stdout) {
        Ok(serde_json::Value::Object(obj)) if obj.contains_key("output") => {
            serde_json::from_value(serde_json::Value::Object(obj.clone()))
                .unwrap_or_else(|_| AgentOutcome::success(serde_json::Value::Object(obj)))
        }
        Ok(other) => AgentOutcome::success(other),
        Err(_) => AgentOutcome::success(serde_json::Value::String(stdout.to_string())),
    }
}

impl AgentCollaborator for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn execute(&self, task: AgentTask) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(self.run(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> AgentTask {
        AgentTask {
            node_id: "draft".into(),
            goal: "write".into(),
            input_data: Default::default(),
            required_tags: vec![],
            prior_examples: vec![],
        }
    }

    #[test]
    fn test_parse_outcome_shapes() {
        let out = parse_outcome(r#"{"output": {"x": 1}, "success": false}"#);
        assert!(!out.success);
        assert_eq!(out.output, json!({"x": 1}));

        let out = parse_outcome(r#"{"summary": "done"}"#);
        assert!(out.success);
        assert_eq!(out.output, json!({"summary": "done"}));

        let out = parse_outcome("just text");
        assert_eq!(out.output, json!("just text"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_roundtrip() {
        let agent = CommandAgent::new("echo", "sh").with_args(&[
            "-c",
            r#"cat > /dev/null; echo '{"output": "ok", "success": true}'"#,
        ]);
        let out = agent.execute(task()).await.unwrap();
        assert_eq!(out.output, json!("ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_delegation_error() {
        let agent = CommandAgent::new("bad", "sh").with_args(&["-c", "echo nope >&2; exit 3"]);
        match agent.execute(task()).await {
            Err(GateflowError::AgentDelegation { message, .. }) => {
                assert!(message.contains("code 3"));
            }
            other => panic!("expected delegation error, got {:?}", other.map(|o| o.output)),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let agent = CommandAgent::new("slow", "sh")
            .with_args(&["-c", "sleep 5"])
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(
            agent.execute(task()).await,
            Err(GateflowError::AgentTimeout { .. })
        ));
    }
}
