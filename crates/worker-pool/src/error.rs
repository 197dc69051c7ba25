//! Tool execution error types.

use thiserror::Error;

use noetl_engine::ErrorKind;

/// Errors that can occur while executing a command.
#[derive(Debug, Error)]
pub enum ToolError {
    /// This worker has no adapter for the tool kind.
    #[error("No adapter for tool kind: {0}")]
    NoAdapter(String),

    /// Execution exceeded the attempt deadline.
    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    /// Process could not be spawned or waited on.
    #[error("Process error: {0}")]
    Process(String),

    /// Process ran and exited unsuccessfully.
    #[error("Command exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    /// The coordinator cancelled the attempt.
    #[error("Cancelled by coordinator")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(String),
}

impl ToolError {
    /// Error kind reported to the coordinator; drives its retry decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::NoAdapter(_) | ToolError::Exit { .. } => ErrorKind::Permanent,
            ToolError::Json(_) => ErrorKind::Configuration,
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::Process(_) => ErrorKind::Transient,
            ToolError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Process(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Json(e.to_string())
    }
}
