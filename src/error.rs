//! Error types for the topology controller.
//!
//! Only [`ServerError::Unavailable`] is allowed to abort a reconciliation pass
//! and force a reconnect. Everything else is scoped to the device it concerns:
//! the caller logs it and moves on.

/// Failure of a call into the audio server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    /// The server connection is gone (daemon restarted, socket closed,
    /// client tool missing). Triggers a full reconnect and rescan.
    #[error("audio server unavailable: {0}")]
    Unavailable(String),

    /// The server answered but refused a single operation, e.g. an index
    /// that vanished between listing and acting on it.
    #[error("audio server rejected {operation}: {reason}")]
    Rejected {
        /// Operation that was refused.
        operation: String,
        /// Server-provided reason.
        reason: String,
    },
}

impl ServerError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ServerError::Unavailable(reason.into())
    }

    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerError::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether this failure must tear down controller-level state.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ServerError::Unavailable(_))
    }
}

/// A routing module's argument string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleArgsError {
    #[error("argument token '{0}' has no '=' separator")]
    MissingSeparator(String),

    #[error("argument token '{0}' has an empty key")]
    EmptyKey(String),

    #[error("unterminated quote in argument string '{0}'")]
    UnterminatedQuote(String),

    #[error("argument key '{0}' appears more than once")]
    DuplicateKey(String),
}
