//! The tool-call surface adapters use to reach storage, events, and peers.
//!
//! Tool failures are values, not panics: every error carries a stable
//! code (`ToolError::code`) so adapter code can branch — typically into a
//! retry outcome — instead of unwinding through the scheduler.

pub mod invoker;

use serde_json::{json, Value};

pub use invoker::{InvokerFactory, ToolInvoker};

/// The tick identity a tool invoker is bound to.
///
/// Invokers are owned by the current tick; they have no meaningful life
/// outside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickContext {
    pub session_id: String,
    pub run_id: String,
    pub tick_id: String,
}

/// Error from a tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("write to {scope} '{key}' was not read this tick")]
    RbwViolation { scope: &'static str, key: String },
    #[error("read_scoped already called this tick")]
    ReadAlreadyCalled,
    #[error("write_scoped already called this tick")]
    WriteAlreadyCalled,
    #[error("write_scoped called before read_scoped")]
    WriteBeforeRead,
    #[error("scope mismatch: {0}")]
    InvalidScope(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("unknown clog: {0}")]
    UnknownClog(String),
    #[error("clog '{clog}' has no endpoint '{method}'")]
    UnknownEndpoint { clog: String, method: String },
    #[error("invalid tool parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ToolError {
    /// Stable machine-readable code for adapter branching.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::RbwViolation { .. } => "RBW_VIOLATION",
            ToolError::ReadAlreadyCalled => "STORAGE_READ_ALREADY_CALLED",
            ToolError::WriteAlreadyCalled => "STORAGE_WRITE_ALREADY_CALLED",
            ToolError::WriteBeforeRead => "STORAGE_WRITE_BEFORE_READ",
            ToolError::InvalidScope(_) => "INVALID_SCOPE",
            ToolError::UnknownTool(_) => "UNKNOWN_TOOL",
            ToolError::UnknownClog(_) => "UNKNOWN_CLOG",
            ToolError::UnknownEndpoint { .. } => "UNKNOWN_ENDPOINT",
            ToolError::InvalidParams(_) => "INVALID_PARAMS",
            ToolError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// The `{ok:false, error:{…}}` envelope returned by the JSON
    /// dispatch surface.
    pub fn to_envelope(&self) -> Value {
        let details = match self {
            ToolError::RbwViolation { scope, key } => json!({ "scope": scope, "key": key }),
            ToolError::UnknownEndpoint { clog, method } => {
                json!({ "clog": clog, "method": method })
            }
            _ => Value::Null,
        };
        json!({
            "ok": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": details,
            }
        })
    }
}

/// Helper to deserialize tool arguments from a JSON Value.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidParams(e.to_string()))
}
