use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateflowError {
    // Rule errors
    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(String),

    // Tree errors
    #[error("Flow tree integrity error: {0}")]
    TreeIntegrity(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Collaborator errors
    #[error("Agent delegation failed: {node}: {message}")]
    AgentDelegation { node: String, message: String },

    #[error("Agent timeout after {timeout_secs}s: {node}")]
    AgentTimeout { node: String, timeout_secs: u64 },

    #[error("Human decision failed for gate {gate}: {reason}")]
    HumanDecision { gate: String, reason: String },

    // Execution errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GateflowError>;
