//! Error types shared across the agent, tools, proxy and session store
//!
//! Every concrete error maps onto one [`ErrorKind`], which is the taxonomy
//! front ends and metrics labels use.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ModelUnavailable,
    ModelCapabilityRejected,
    ToolNotFound,
    ToolArgumentInvalid,
    ToolTimeout,
    ProxyUnavailable,
    SandboxViolation,
    SessionNotFound,
    StorageIOError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ModelCapabilityRejected => "model_capability_rejected",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolArgumentInvalid => "tool_argument_invalid",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ProxyUnavailable => "proxy_unavailable",
            ErrorKind::SandboxViolation => "sandbox_violation",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::StorageIOError => "storage_io_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category of a single tool call, persisted on tool turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    ArgumentInvalid,
    Timeout,
    ProxyUnavailable,
    SandboxViolation,
    /// The tool ran and its backend reported an error
    Failed,
    Cancelled,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::ArgumentInvalid => "argument_invalid",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::ProxyUnavailable => "proxy_unavailable",
            ToolErrorKind::SandboxViolation => "sandbox_violation",
            ToolErrorKind::Failed => "failed",
            ToolErrorKind::Cancelled => "cancelled",
        }
    }

    /// Taxonomy entry, if the failure has one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ToolErrorKind::NotFound => Some(ErrorKind::ToolNotFound),
            ToolErrorKind::ArgumentInvalid => Some(ErrorKind::ToolArgumentInvalid),
            ToolErrorKind::Timeout => Some(ErrorKind::ToolTimeout),
            ToolErrorKind::ProxyUnavailable => Some(ErrorKind::ProxyUnavailable),
            ToolErrorKind::SandboxViolation => Some(ErrorKind::SandboxViolation),
            ToolErrorKind::Cancelled => Some(ErrorKind::Cancelled),
            ToolErrorKind::Failed => None,
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool failure with its category and a human-readable message
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ArgumentInvalid, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Failed, message)
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::SandboxViolation, message)
    }
}

/// Errors from a model backend call
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Transport failure or non-success status
    #[error("model request failed: {0}")]
    Unavailable(String),
    /// The call did not finish within the configured timeout
    #[error("model call timed out after {0}s")]
    Timeout(u64),
    /// The backend answered with something we could not decode
    #[error("malformed model response: {0}")]
    Malformed(String),
    /// The backend refused a requested capability (e.g. extended reasoning)
    #[error("model rejected requested capability: {0}")]
    CapabilityRejected(String),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::CapabilityRejected(_) => ErrorKind::ModelCapabilityRejected,
            _ => ErrorKind::ModelUnavailable,
        }
    }
}

/// Errors from the session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid session id: {0:?}")]
    InvalidId(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("corrupt session data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::InvalidId(_) => ErrorKind::SessionNotFound,
            StoreError::Io { .. } | StoreError::Corrupt(_) => ErrorKind::StorageIOError,
        }
    }
}

/// Errors from the proxy supervisor
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("proxy disabled by configuration")]
    Disabled,
    #[error("proxy binary not found")]
    NotFound,
    #[error("port allocation failed: {0}")]
    Ports(String),
    #[error("failed to spawn proxy: {0}")]
    Spawn(String),
    #[error("control channel error: {0}")]
    Control(String),
    #[error("proxy exited during bootstrap: {0}")]
    Exited(String),
    #[error("proxy exited unexpectedly: {0}")]
    ExitedUnexpectedly(String),
    #[error("proxy not ready after {0}s")]
    Timeout(u64),
}

/// Errors that end a user turn
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model failed on both the primary and the fallback attempt
    #[error("model unavailable: {0}")]
    ModelUnavailable(ModelError),
    /// The model rejected the reduced request as well
    #[error("model capability rejected: {0}")]
    ModelCapabilityRejected(ModelError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("turn cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            AgentError::ModelCapabilityRejected(_) => ErrorKind::ModelCapabilityRejected,
            AgentError::Storage(e) => e.kind(),
            AgentError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<ModelError> for AgentError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::CapabilityRejected(_) => AgentError::ModelCapabilityRejected(e),
            other => AgentError::ModelUnavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_kinds() {
        assert_eq!(
            StoreError::NotFound("abc".into()).kind(),
            ErrorKind::SessionNotFound
        );
        let io = StoreError::io("writing meta", io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::StorageIOError);
        assert!(io.to_string().contains("writing meta"));
    }

    #[test]
    fn test_agent_error_from_model_error() {
        let err: AgentError = ModelError::CapabilityRejected("think".into()).into();
        assert_eq!(err.kind(), ErrorKind::ModelCapabilityRejected);

        let err: AgentError = ModelError::Timeout(30).into();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[test]
    fn test_tool_error_kind_serde() {
        let json = serde_json::to_string(&ToolErrorKind::ProxyUnavailable).unwrap();
        assert_eq!(json, "\"proxy_unavailable\"");
        let back: ToolErrorKind = serde_json::from_str("\"sandbox_violation\"").unwrap();
        assert_eq!(back, ToolErrorKind::SandboxViolation);
        assert_eq!(back.kind(), Some(ErrorKind::SandboxViolation));
    }

    #[test]
    fn test_proxy_exit_messages_name_the_phase() {
        let bootstrap = ProxyError::Exited("exit status: 1".into()).to_string();
        let runtime = ProxyError::ExitedUnexpectedly("signal: 9 (SIGKILL)".into()).to_string();
        assert!(bootstrap.contains("during bootstrap"));
        assert!(runtime.contains("exited unexpectedly"));
        assert!(!runtime.contains("bootstrap"));
    }
}
