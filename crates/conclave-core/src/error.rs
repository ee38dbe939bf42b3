//! Error types for conclave-core

use thiserror::Error;

/// Errors surfaced synchronously by sessions, runtimes and mailboxes.
///
/// Task-level failures (provider or tool errors mid-task) are not raised
/// through this type; they are reported as failed [`TaskResult`]s.
///
/// [`TaskResult`]: crate::agents::TaskResult
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Malformed request (empty prompt, bad duration, missing field)
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    /// The agent exists in the registry but has no running runtime
    #[error("agent '{0}' has not been created in this session")]
    AgentNotCreated(String),

    #[error("agent '{0}' is stopped")]
    AgentStopped(String),

    /// Recipient mailbox missing or closed; mail was not enqueued
    #[error("mailbox for '{0}' is unavailable")]
    MailboxUnavailable(String),

    #[error("no active agent in session")]
    NoActiveAgent,
}

impl ConclaveError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for errors caused by the caller's input rather than system state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownAgent(_)
                | Self::UnknownSession(_)
                | Self::AgentNotCreated(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConclaveError::UnknownAgent("ghost".to_string());
        assert_eq!(err.to_string(), "unknown agent 'ghost'");

        let err = ConclaveError::MailboxUnavailable("b".to_string());
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_is_validation() {
        assert!(ConclaveError::validation("empty prompt").is_validation());
        assert!(ConclaveError::UnknownAgent("x".into()).is_validation());
        assert!(!ConclaveError::MailboxUnavailable("x".into()).is_validation());
        assert!(!ConclaveError::AgentStopped("x".into()).is_validation());
    }
}
