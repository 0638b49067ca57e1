//! Error types for the arbor runtime.
//!
//! One crate-level [`Error`] enum covers every failure the runtime can
//! surface to a caller. Failures inside a tool executor are deliberately
//! *not* part of this enum: they are encoded into tool-result message
//! parts and the run continues (see [`crate::tool::ToolFailure`]).

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request is malformed: bad manifest set, unknown approval id,
    /// a run in a status that does not admit the operation, or a
    /// suspension stack shorter than two entries.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A referenced run state or manifest does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The run exceeded its configured deadline, accumulated across
    /// resumes.
    #[error("run timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        /// Accumulated execution time when the deadline fired.
        elapsed_ms: u64,
        /// The configured limit.
        limit_ms: u64,
    },

    /// The run was cancelled cooperatively.
    #[error("run was cancelled")]
    Cancelled,

    /// The output tool's arguments failed schema validation and retries
    /// are exhausted (or disabled).
    #[error("output validation failed: {0}")]
    OutputValidation(String),

    /// A tool executor or lifecycle hook failed in a way that aborts the
    /// run rather than being encoded as a tool result.
    #[error("tool '{name}' failed: {message}")]
    Tool {
        /// Name of the failing tool or hook.
        name: String,
        /// The underlying failure.
        message: String,
    },

    /// The completions gateway or another upstream dependency failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// An internal invariant was violated. Seeing this is a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new bad-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Create a new not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a new timeout error.
    #[must_use]
    pub const fn timeout(elapsed_ms: u64, limit_ms: u64) -> Self {
        Self::Timeout {
            elapsed_ms,
            limit_ms,
        }
    }

    /// Create a new output-validation error.
    #[must_use]
    pub fn output_validation(message: impl Into<String>) -> Self {
        Self::OutputValidation(message.into())
    }

    /// Create a new tool error.
    #[must_use]
    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a new upstream error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check whether this error terminates the run as `cancelled` rather
    /// than `error`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::timeout(61_000, 60_000);
        assert_eq!(err.to_string(), "run timed out after 61000ms (limit 60000ms)");

        let err = Error::tool("search", "connection reset");
        assert_eq!(err.to_string(), "tool 'search' failed: connection reset");
    }

    #[test]
    fn cancelled_is_distinguished() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::bad_request("nope").is_cancelled());
    }
}
