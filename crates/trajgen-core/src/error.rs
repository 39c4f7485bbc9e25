use std::path::PathBuf;

use thiserror::Error;

/// Core error type for trajgen.
#[derive(Debug, Error)]
pub enum TrajgenError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrajgenError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Classification consulted by [`crate::RetryPolicy`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Failure raised while dispatching a tool invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// Unreachable backend, timeout, rate limit or server-side error.
    #[error("transient tool failure: {0}")]
    Transient(String),
    /// Bad parameters, authentication failure or any other non-recoverable error.
    #[error("tool failure: {0}")]
    Permanent(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Short label used for metrics and the diagnostic call log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::UnknownTool(_) => "unknown_tool",
        }
    }
}

impl Retryable for ToolError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure raised by a language model backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model request rejected: {0}")]
    Permanent(String),
}

impl ModelError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }
}

impl Retryable for ModelError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ToolError::transient("timeout").is_retryable());
        assert!(!ToolError::permanent("401").is_retryable());
        assert!(!ToolError::UnknownTool("nope".into()).is_retryable());
        assert!(ModelError::transient("503").is_retryable());
        assert!(!ModelError::permanent("400").is_retryable());
    }

    #[test]
    fn display_includes_reason() {
        let err = ToolError::UnknownTool("web_magic".into());
        assert_eq!(err.to_string(), "unknown tool: web_magic");
        assert_eq!(err.kind(), "unknown_tool");
    }
}
