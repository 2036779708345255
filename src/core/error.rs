use std::path::PathBuf;

use thiserror::Error;

/// Why a run reached a failed/cancelled terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Network or auth problem reaching the backend.
    BackendUnavailable,
    /// The configured per-run timeout elapsed. Not retried.
    BackendTimeout,
    /// The backend rejected the request on policy/permission grounds.
    BackendRefused,
    /// Caller-initiated cancellation.
    Cancelled,
}

impl RunErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunErrorKind::BackendUnavailable => "backend_unavailable",
            RunErrorKind::BackendTimeout => "backend_timeout",
            RunErrorKind::BackendRefused => "backend_refused",
            RunErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: RunErrorKind::BackendUnavailable,
            message: message.into(),
        }
    }

    pub fn timeout(secs: u64) -> Self {
        Self {
            kind: RunErrorKind::BackendTimeout,
            message: format!("run exceeded the {}s timeout", secs),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            kind: RunErrorKind::BackendRefused,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: RunErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }
}

/// Store-level failures. Per-record corruption is localized: loaders
/// skip the bad record with a warning instead of surfacing `Corrupt`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
