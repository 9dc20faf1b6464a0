//! Change-capture error model.

use thiserror::Error;

/// Result type used across the change-capture layer.
pub type ChangeResult<T> = Result<T, ChangeError>;

/// Change-capture error.
///
/// None of these are retried by the engine. Retry policy, if any, belongs to the
/// transaction manager driving the unit of work.
#[derive(Debug, Error)]
pub enum ChangeError {
    /// A deferred identity could not produce a key at finalisation, or an identity
    /// field could not be read. Notification-path failure; the data write stands.
    #[error("unresolved identity for {entity_type}: {reason}")]
    UnresolvedIdentity { entity_type: String, reason: String },

    /// Operation invoked on a unit of work that is no longer open.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// One or more listeners returned an error.
    #[error("{} listener(s) failed: {}", failures.len(), summarize(failures))]
    ListenerFailure { failures: Vec<ListenerFailure> },

    /// The lifecycle events reported for one identity cannot happen in that order
    /// (e.g. an update after a delete).
    #[error("inconsistent lifecycle for {identity}: {reason}")]
    InconsistentLifecycle { identity: String, reason: String },

    /// An identifier string could not be parsed.
    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl ChangeError {
    pub fn unresolved(entity_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvedIdentity {
            entity_type: entity_type.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn inconsistent(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InconsistentLifecycle {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn listeners(failures: Vec<ListenerFailure>) -> Self {
        Self::ListenerFailure { failures }
    }
}

/// Failure of a single listener.
#[derive(Debug, Error)]
#[error("listener `{listener}` failed: {error:#}")]
pub struct ListenerFailure {
    pub listener: String,
    pub error: anyhow::Error,
}

impl ListenerFailure {
    pub fn new(listener: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            listener: listener.into(),
            error,
        }
    }
}

fn summarize(failures: &[ListenerFailure]) -> String {
    failures
        .iter()
        .map(|f| f.listener.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
