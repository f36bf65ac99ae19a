use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::event::EventBus;
use gateflow_core::traits::HumanGateCollaborator;
use gateflow_core::types::{ExecutionId, FlowEvent, HumanDecision, HumanGateRequest};

/// Manages pending human-gate requests with oneshot channels.
///
/// The executor's request blocks on a receiver; whoever is watching the event
/// bus (terminal prompt, tests) answers through `respond`.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, (HumanGateRequest, oneshot::Sender<HumanDecision>)>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request, publish it, and return the receiver to await.
    pub async fn submit(&self, req: HumanGateRequest) -> oneshot::Receiver<HumanDecision> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        prune_abandoned(&mut pending);
        pending.insert(req.id.clone(), (req.clone(), tx));
        drop(pending);
        self.event_bus
            .publish(FlowEvent::HumanDecisionRequested { request: req });
        rx
    }

    /// Answer a pending request. Returns true if it was found and its gate
    /// was still waiting.
    pub async fn respond(&self, request_id: &str, decision: HumanDecision) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        if let Some((req, tx)) = entry {
            if tx.is_closed() {
                warn!(
                    request_id,
                    gate = %req.gate_node_id,
                    "Gate stopped waiting; decision ignored"
                );
                return false;
            }
            info!(
                request_id,
                gate = %req.gate_node_id,
                decision = %decision.decision_label,
                actor = %decision.actor,
                "Human decision received"
            );
            self.event_bus.publish(FlowEvent::HumanDecisionResolved {
                request_id: request_id.to_string(),
                decision_label: decision.decision_label.clone(),
            });
            tx.send(decision).is_ok()
        } else {
            false
        }
    }

    /// Requests whose gate is still waiting.
    pub async fn pending_requests(&self) -> Vec<HumanGateRequest> {
        let mut pending = self.pending.lock().await;
        prune_abandoned(&mut pending);
        pending.values().map(|(req, _)| req.clone()).collect()
    }

    /// Waiting requests of one execution. A watcher that lagged behind the
    /// bus re-reads these to find requests whose events it missed.
    pub async fn pending_for(&self, execution_id: &ExecutionId) -> Vec<HumanGateRequest> {
        let mut requests: Vec<HumanGateRequest> = self
            .pending_requests()
            .await
            .into_iter()
            .filter(|req| &req.execution_id == execution_id)
            .collect();
        requests.sort_by(|a, b| a.id.cmp(&b.id));
        requests
    }

    /// Drop a request nobody will answer any more.
    pub async fn withdraw(&self, request_id: &str) -> bool {
        self.pending.lock().await.remove(request_id).is_some()
    }
}

/// Drop requests whose waiter went away (deadline or cancellation).
fn prune_abandoned(
    pending: &mut HashMap<String, (HumanGateRequest, oneshot::Sender<HumanDecision>)>,
) {
    pending.retain(|_, (_, tx)| !tx.is_closed());
}

impl HumanGateCollaborator for ApprovalBroker {
    fn request(&self, request: HumanGateRequest) -> BoxFuture<'_, Result<HumanDecision>> {
        Box::pin(async move {
            let id = request.id.clone();
            let gate = request.gate_node_id.clone();
            let rx = self.submit(request).await;
            match rx.await {
                Ok(decision) => Ok(decision),
                Err(_) => {
                    self.withdraw(&id).await;
                    Err(GateflowError::HumanDecision {
                        gate,
                        reason: "request was dropped without a decision".to_string(),
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request(id: &str) -> HumanGateRequest {
        HumanGateRequest {
            id: id.to_string(),
            execution_id: ExecutionId::new(),
            gate_node_id: "signoff".to_string(),
            approvers: vec!["lead".to_string()],
            information_package: serde_json::json!({"score": 90.0}),
            deadline: None,
            allowed_labels: vec!["GO".to_string(), "KILL".to_string()],
        }
    }

    #[tokio::test]
    async fn respond_resolves_request() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        let rx = broker.submit(test_request("req-1")).await;
        assert!(
            broker
                .respond("req-1", HumanDecision::new("GO", "lead").with_comment("fine"))
                .await
        );
        let decision = rx.await.unwrap();
        assert_eq!(decision.decision_label, "GO");
        assert_eq!(decision.comment.as_deref(), Some("fine"));
    }

    #[tokio::test]
    async fn respond_unknown_id() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        assert!(!broker.respond("nonexistent", HumanDecision::new("GO", "x")).await);
    }

    #[tokio::test]
    async fn collaborator_waits_for_bus_driven_answer() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ApprovalBroker::new(bus.clone()));
        let mut rx = bus.subscribe();

        let answering = broker.clone();
        let responder = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let FlowEvent::HumanDecisionRequested { request } = event {
                    answering
                        .respond(&request.id, HumanDecision::new("KILL", "lead"))
                        .await;
                    break;
                }
            }
        });

        let decision = broker.request(test_request("req-2")).await.unwrap();
        assert_eq!(decision.decision_label, "KILL");
        responder.await.unwrap();
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn listing_skips_abandoned_requests() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        let _a = broker.submit(test_request("abc-123")).await;
        let b = broker.submit(test_request("def-456")).await;
        assert_eq!(broker.pending_requests().await.len(), 2);

        drop(b);
        let pending = broker.pending_requests().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "abc-123");
    }

    #[tokio::test]
    async fn lagged_watcher_recovers_requests_from_the_broker() {
        let bus = Arc::new(EventBus::new(1));
        let broker = ApprovalBroker::new(bus.clone());
        let mut rx = bus.subscribe();
        let execution = ExecutionId::new();

        let mut first = test_request("req-a");
        first.execution_id = execution.clone();
        let mut second = test_request("req-b");
        second.execution_id = execution.clone();
        let _a = broker.submit(first).await;
        let _b = broker.submit(second).await;
        let _other = broker.submit(test_request("req-c")).await;

        assert!(matches!(
            rx.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
        ));
        let missed: Vec<String> = broker
            .pending_for(&execution)
            .await
            .into_iter()
            .map(|req| req.id)
            .collect();
        assert_eq!(missed, vec!["req-a", "req-b"]);

        assert!(broker.respond("req-a", HumanDecision::new("GO", "lead")).await);
        assert_eq!(broker.pending_for(&execution).await.len(), 1);
    }

    #[tokio::test]
    async fn answer_after_deadline_is_ignored() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        let rx = broker.submit(test_request("req-3")).await;
        let result = tokio::time::timeout(std::time::Duration::from_millis(10), rx).await;
        assert!(result.is_err());
        assert!(!broker.respond("req-3", HumanDecision::new("GO", "late")).await);
    }
}
