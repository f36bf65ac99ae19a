use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::trace;

use gateflow_core::error::{GateflowError, Result};
use gateflow_core::event::EventBus;
use gateflow_core::traits::FlowStore;
use gateflow_core::types::{Actor, AuditEventType, AuditLogEntry, ExecutionId, FlowEvent};

struct LedgerState {
    next_sequence: u64,
    entries: Vec<AuditLogEntry>,
}

/// Append-only audit ledger for one execution.
///
/// Sequence allocation, persistence and publication happen under one lock,
/// so the stored ledger, the in-memory copy and the event stream all agree
/// on a single total order starting at 1.
pub struct AuditLedger {
    execution_id: ExecutionId,
    store: Arc<dyn FlowStore>,
    event_bus: Arc<EventBus>,
    state: Mutex<LedgerState>,
}

impl AuditLedger {
    pub fn new(execution_id: ExecutionId, store: Arc<dyn FlowStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            execution_id,
            store,
            event_bus,
            state: Mutex::new(LedgerState {
                next_sequence: 1,
                entries: Vec::new(),
            }),
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn append(
        &self,
        node_id: Option<&str>,
        event_type: AuditEventType,
        actor: Actor,
        payload: serde_json::Value,
    ) -> Result<AuditLogEntry> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| GateflowError::Database(format!("ledger lock poisoned: {}", e)))?;

        let entry = AuditLogEntry {
            sequence: state.next_sequence,
            execution_id: self.execution_id.clone(),
            node_id: node_id.map(|n| n.to_string()),
            event_type,
            actor,
            timestamp: Utc::now(),
            payload,
        };
        self.store.append_audit(&entry)?;
        state.next_sequence += 1;
        state.entries.push(entry.clone());
        self.event_bus.publish(FlowEvent::Audit(entry.clone()));

        trace!(
            execution_id = %self.execution_id,
            sequence = entry.sequence,
            event = %entry.event_type,
            "Ledger entry appended"
        );
        Ok(entry)
    }

    /// Entries appended so far, in sequence order.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.state
            .lock()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }
}
