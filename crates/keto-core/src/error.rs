use std::time::Duration;

use crate::tags::NodeId;

/// Convenience alias used across the keto crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the bootstrap token protocol and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration field is missing or out of range.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The tag store has no node with this id.
    #[error("node {0} not found")]
    NotFound(NodeId),

    /// No tag store provider is registered under this name.
    #[error("provider not registered: {0}")]
    ProviderNotRegistered(String),

    /// The claimant did not see a token before its deadline.
    #[error("operation timed out after {}", format_duration(.0))]
    TimedOut(Duration),

    /// Credential creation gave up after exhausting its retry policy.
    #[error("failed to issue credential for node {node} after {attempts} attempts: {reason}")]
    IssuanceFailed {
        node: NodeId,
        attempts: u32,
        reason: String,
    },

    /// The registration tag could not be written after a credential was created.
    /// `compensation` carries the error of the follow-up credential delete, if that failed too.
    #[error("failed to write registration tag on node {node}: {reason}{}", compensation_suffix(.compensation))]
    TagWriteFailed {
        node: NodeId,
        reason: String,
        compensation: Option<String>,
    },

    /// A token or token id does not match the expected grammar.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The OS randomness source could not supply bytes.
    #[error("random source unavailable: {0}")]
    RandomSource(String),

    /// The tag store failed for a reason other than an unknown node.
    #[error("tag store error: {0}")]
    Store(String),

    /// The credential backing store failed.
    #[error("credential store error: {0}")]
    Credential(String),

    /// A credential with this name already exists in the backing store.
    #[error("credential {0} already exists")]
    AlreadyExists(String),

    /// Local file output failed.
    #[error("io error: {0}")]
    Io(String),
}

fn format_duration(duration: &Duration) -> String {
    humantime::format_duration(*duration).to_string()
}

fn compensation_suffix(compensation: &Option<String>) -> String {
    match compensation {
        Some(e) => format!("; compensating delete also failed, credential orphaned: {e}"),
        None => String::new(),
    }
}

impl Error {
    /// Whether a single issuance attempt failing with this error may be retried.
    ///
    /// Id collisions and transient store failures are retryable. Randomness and
    /// encoding failures end the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_) | Error::Credential(_) | Error::Store(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::AlreadyExists("bootstrap-token-abc123".into()).is_retryable());
        assert!(Error::Credential("503".into()).is_retryable());
        assert!(!Error::RandomSource("exhausted".into()).is_retryable());
        assert!(!Error::MalformedToken("x".into()).is_retryable());
        assert!(!Error::NotFound(NodeId::from("i-1")).is_retryable());
    }

    #[test]
    fn test_tag_write_failed_reports_both_errors() {
        let err = Error::TagWriteFailed {
            node: NodeId::from("i-1"),
            reason: "throttled".into(),
            compensation: Some("forbidden".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("throttled"));
        assert!(msg.contains("forbidden"));
        assert!(msg.contains("orphaned"));

        let err = Error::TagWriteFailed {
            node: NodeId::from("i-1"),
            reason: "throttled".into(),
            compensation: None,
        };
        assert!(!err.to_string().contains("orphaned"));
    }

    #[test]
    fn test_timed_out_display() {
        let err = Error::TimedOut(Duration::from_secs(90));
        assert_eq!(err.to_string(), "operation timed out after 1m 30s");
    }
}
