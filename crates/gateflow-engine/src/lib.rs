pub mod approval;
pub mod command;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod registry;
pub mod run_log;

pub use approval::ApprovalBroker;
pub use command::CommandAgent;
pub use executor::{ExecutionReport, FlowExecutor};
pub use ledger::AuditLedger;
pub use memory::WorkingMemory;
pub use registry::AgentRegistry;
pub use run_log::RunLogger;
