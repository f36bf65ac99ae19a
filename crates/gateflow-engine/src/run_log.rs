use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use gateflow_core::event::EventBus;
use gateflow_core::types::{AuditEventType, AuditLogEntry, ExecutionId, FlowEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and mirrors one execution's ledger entries to
/// `{log_dir}/{execution_id}/{timestamp}.jsonl`, one JSON object per line,
/// flushed after every line.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    sequence: u64,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = execution and gate decisions,
    /// 2 = + node visits, routing, recycles and halts, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task until the execution finishes or
    /// `cancel` fires.
    ///
    /// The subscription is taken when `run` is called, before the returned
    /// future is spawned, so no event published after this call is missed.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send + 'static {
        let rx = event_bus.subscribe();
        self.write_log(rx, execution_id, cancel)
    }

    async fn write_log(
        self,
        mut rx: broadcast::Receiver<FlowEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        let exec_dir = self.log_dir.join(&execution_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&exec_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = exec_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(FlowEvent::Audit(entry)) if entry.execution_id == execution_id => {
                            let Some(line) = self.entry_for(&entry) else { continue };
                            if let Ok(json) = serde_json::to_string(&line) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        Ok(FlowEvent::ExecutionFinished { execution_id: finished, .. })
                            if finished == execution_id =>
                        {
                            break;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    fn level_of(event: AuditEventType) -> u8 {
        use AuditEventType::*;
        match event {
            ExecutionStarted | ExecutionCompleted | ExecutionFailed | GateDecided => 1,
            NodeStarted | NodeCompleted | ExecutionHalted | ExecutionResumed
            | HumanDecisionRequested | HumanDecisionReceived | RouteSelected
            | RecycleTriggered => 2,
            RuleChecked | MemoryWritten | TransformApplied | AgentAttempt | SubgoalDispatched | SubgoalRejected
            | EpisodeRecorded => 3,
        }
    }

    /// Convert a ledger entry to a log line (None if filtered by level).
    fn entry_for(&self, entry: &AuditLogEntry) -> Option<LogEntry> {
        if Self::level_of(entry.event_type) > self.level {
            return None;
        }
        Some(LogEntry {
            timestamp: entry.timestamp.to_rfc3339(),
            execution_id: entry.execution_id.0.clone(),
            sequence: entry.sequence,
            event_type: entry.event_type.as_str().to_string(),
            node_id: entry.node_id.clone(),
            actor: entry.actor.to_string(),
            detail: match &entry.payload {
                serde_json::Value::Null => None,
                payload => Some(truncate_json(payload, 2000)),
            },
        })
    }
}

/// Large payloads are logged as a truncated string preview.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> serde_json::Value {
    let s = value.to_string();
    if s.len() <= max_len {
        value.clone()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        serde_json::Value::String(format!("{}...", &s[..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateflow_core::types::{Actor, ExecutionStatus};
    use serde_json::json;

    fn entry(id: &ExecutionId, seq: u64, event_type: AuditEventType) -> AuditLogEntry {
        AuditLogEntry {
            sequence: seq,
            execution_id: id.clone(),
            node_id: None,
            event_type,
            actor: Actor::Engine,
            timestamp: Utc::now(),
            payload: json!({"n": seq}),
        }
    }

    #[test]
    fn test_level_filtering() {
        let id = ExecutionId::new();
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.entry_for(&entry(&id, 1, AuditEventType::GateDecided)).is_some());
        assert!(logger.entry_for(&entry(&id, 2, AuditEventType::NodeStarted)).is_none());

        let verbose = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(verbose.entry_for(&entry(&id, 3, AuditEventType::RuleChecked)).is_some());
    }

    #[test]
    fn test_jsonl_line_format() {
        let id = ExecutionId::from_string("exec-1");
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let mut e = entry(&id, 7, AuditEventType::NodeCompleted);
        e.payload = serde_json::Value::Null;
        let json = serde_json::to_string(&logger.entry_for(&e).unwrap()).unwrap();
        assert!(json.contains("\"sequence\":7"));
        assert!(json.contains("node_completed"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_truncate_json() {
        let long = json!({"text": "x".repeat(100)});
        assert_eq!(truncate_json(&long, 1000), long);
        let cut = truncate_json(&long, 20);
        assert!(cut.as_str().unwrap().ends_with("..."));
    }

    #[tokio::test]
    async fn test_writes_only_own_execution() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let id = ExecutionId::new();
        let other = ExecutionId::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 3);
        let handle = tokio::spawn(logger.run(bus.clone(), id.clone(), CancellationToken::new()));

        bus.publish(FlowEvent::Audit(entry(&id, 1, AuditEventType::ExecutionStarted)));
        bus.publish(FlowEvent::Audit(entry(&other, 1, AuditEventType::ExecutionStarted)));
        bus.publish(FlowEvent::Audit(entry(&id, 2, AuditEventType::ExecutionCompleted)));
        bus.publish(FlowEvent::ExecutionFinished {
            execution_id: id.clone(),
            status: ExecutionStatus::Completed,
        });
        handle.await.unwrap();

        let exec_dir = dir.path().join(&id.0);
        let file = std::fs::read_dir(&exec_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("execution_started"));
        assert!(lines[1].contains("execution_completed"));
    }
}
