use crate::types::FlowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionId, ExecutionStatus};

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(FlowEvent::ExecutionFinished {
            execution_id: ExecutionId::from_string("e1"),
            status: ExecutionStatus::Completed,
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                FlowEvent::ExecutionFinished { status, .. } => {
                    assert_eq!(status, ExecutionStatus::Completed)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(FlowEvent::HumanDecisionResolved {
            request_id: "r".into(),
            decision_label: "GO".into(),
        });
    }
}
