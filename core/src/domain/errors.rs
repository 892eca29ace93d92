use thiserror::Error;

/// Errors surfaced by setup/teardown operations: registration, connection,
/// and lifecycle transitions. Anything reachable from `execute_tool` never
/// returns this type — failures there are encoded as `ToolResult::error`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("server '{0}' is not registered")]
    UnknownServer(String),

    #[error("tool '{0}' is not registered")]
    UnknownTool(String),

    #[error("transport error for server '{server_id}': {message}")]
    Transport { server_id: String, message: String },

    #[error("remote error from server '{server_id}': {message} (code {code})")]
    Remote {
        server_id: String,
        code: i64,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server '{0}' is not in a state that allows this operation (current: {1})")]
    InvalidState(String, String),

    #[error("request to server '{server_id}' timed out after {timeout_secs}s")]
    Timeout { server_id: String, timeout_secs: f64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
