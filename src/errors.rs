//! Typed error hierarchy for the orchestration engine.
//!
//! Three top-level enums cover the three external seams:
//! - `InferenceError` — failures of the LLM inference contract
//! - `SandboxError` — failures of sandbox service calls
//! - `ToolError` — failures inside a planned tool batch
//!
//! Each enum carries the classification the retry/reset policies key on:
//! cancellation is terminal-but-clean, rate limits and security violations
//! are never retried, transient infrastructure failures reset the session
//! and retry with backoff.

use thiserror::Error;

/// Errors from the inference service seam.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference cancelled")]
    Cancelled,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("transient inference failure: {0}")]
    Transient(String),

    #[error("inference failed: {0}")]
    Fatal(String),
}

impl InferenceError {
    /// Transient failures are retried with backoff up to the attempt limit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Cancellation stops the chain cleanly and keeps partial results.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from sandbox service calls.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox instance {instance_id} not found")]
    InstanceNotFound { instance_id: String },

    #[error("lost connection to sandbox service: {0}")]
    ConnectionLost(String),

    #[error("sandbox container gone: {0}")]
    ContainerLost(String),

    #[error("sandbox storage unavailable: {0}")]
    StorageLost(String),

    #[error("sandbox command timed out after {seconds}s")]
    CommandTimeout { seconds: u64 },

    #[error("sandbox request failed: {0}")]
    Request(String),
}

impl SandboxError {
    /// Transient-error signatures that invalidate the cached session and
    /// force a fresh instance on the next deployment attempt.
    pub fn resets_session(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound { .. }
                | Self::ConnectionLost(_)
                | Self::ContainerLost(_)
                | Self::StorageLost(_)
        )
    }
}

/// Errors from a single tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool call cancelled")]
    Cancelled,

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool execution failed: {0}")]
    Execution(String),
}

impl ToolError {
    /// Cancellation is the only failure propagated past sibling calls.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
