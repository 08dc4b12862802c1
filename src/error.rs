//! Error kinds surfaced across the hub core.
//!
//! Every fallible operation in the core returns [`HiveError`]. The kinds
//! map one-to-one onto HTTP statuses at the API boundary (see
//! [`HiveError::http_status`]); handlers render them as
//! `{"error": "<message>"}` bodies.

use thiserror::Error;

/// Typed error kinds for the hub core.
#[derive(Debug, Error)]
pub enum HiveError {
    /// Referenced entity (agent, task, solicitation, port, branch) is unknown.
    #[error("{0} not found")]
    NotFound(String),

    /// Name or resource collision (agent name, worktree, task edge).
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A status change the state machine does not permit.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Task has incomplete blockers.
    #[error("task {0} is blocked by incomplete tasks")]
    Blocked(String),

    /// Port is leased by someone else and the caller declined to wait.
    #[error("port {port} is busy (held by {holder})")]
    Busy {
        /// The contested port.
        port: u16,
        /// Name of the agent holding the lease.
        holder: String,
    },

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Child process never reached a ready state.
    #[error("agent {0} did not become ready")]
    NotReady(String),

    /// Caller asked to release a lease it does not hold.
    #[error("port {0} is not held by the caller")]
    NotHeld(u16),

    /// Port scan exhausted the configured range.
    #[error("no free ports in range {base}..{limit}")]
    NoPorts {
        /// First port probed.
        base: u16,
        /// One past the last port probed.
        limit: u16,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Structural conflict: missing edge endpoints, dependency cycles.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decode failure.
    #[error("decode error: {0}")]
    Decoding(#[from] serde_json::Error),

    /// Child process (drone or git) failed; message carries captured stderr.
    #[error("child process failed: {0}")]
    ChildFailed(String),
}

impl HiveError {
    /// HTTP status the API layer uses for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::InvalidTransition(_) => 400,
            Self::Blocked(_) => 400,
            Self::Busy { .. } => 409,
            Self::Timeout(_) => 504,
            Self::NotReady(_) => 504,
            Self::NotHeld(_) => 409,
            Self::NoPorts { .. } => 503,
            Self::Cancelled => 499,
            Self::Conflict(_) => 409,
            Self::Io(_) => 500,
            Self::Decoding(_) => 400,
            Self::ChildFailed(_) => 500,
        }
    }

    /// Shorthand for a `NotFound` carrying a formatted subject.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, HiveError>;

impl From<reqwest::Error> for HiveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::ChildFailed(err.to_string())
        }
    }
}
