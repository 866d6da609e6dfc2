use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the upstream account client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("verification code is invalid or expired")]
    CodeInvalid,

    #[error("two-factor password is invalid")]
    PasswordInvalid,

    #[error("session is not authorized: {0}")]
    Unauthorized(String),

    #[error("rate limited by upstream{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream rejected request: {0}")]
    Rejected(String),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

fn retry_hint(secs: &Option<u64>) -> String {
    match secs {
        Some(s) => format!(", retry after {s}s"),
        None => String::new(),
    }
}

/// Stable, machine-distinguishable error kinds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    SessionNotFound,
    TaskNotFound,
    ChallengeRejected,
    InvalidCredential,
    UpstreamError,
    CapacityExceeded,
    Storage,
}

#[derive(Error, Debug)]
pub enum KeepaliveError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("login session not found or expired")]
    SessionNotFound,

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("challenge rejected: {0}")]
    ChallengeRejected(String),

    #[error("credential is not valid: {0}")]
    InvalidCredential(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("too many active subscriptions ({capacity}), try again later")]
    CapacityExceeded { capacity: usize },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl KeepaliveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeepaliveError::InvalidInput(_) => ErrorKind::InvalidInput,
            KeepaliveError::SessionNotFound => ErrorKind::SessionNotFound,
            KeepaliveError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            KeepaliveError::ChallengeRejected(_) => ErrorKind::ChallengeRejected,
            KeepaliveError::InvalidCredential(_) => ErrorKind::InvalidCredential,
            KeepaliveError::Upstream(_) => ErrorKind::UpstreamError,
            KeepaliveError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            KeepaliveError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Convert to error kind and sanitized message.
    pub fn to_error_code(&self) -> (ErrorKind, String) {
        match self {
            KeepaliveError::Storage(_) => {
                (ErrorKind::Storage, "internal storage error".to_string())
            }
            _ => (self.kind(), self.to_string()),
        }
    }
}

pub type Result<T, E = KeepaliveError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_message_is_sanitized() {
        let err = KeepaliveError::Storage(anyhow::anyhow!("failed to write /data/secret.json"));
        let (kind, message) = err.to_error_code();
        assert_eq!(kind, ErrorKind::Storage);
        assert!(!message.contains("secret"));
    }

    #[test]
    fn upstream_errors_keep_their_reason() {
        let err: KeepaliveError = UpstreamError::RateLimited {
            retry_after_secs: Some(42),
        }
        .into();
        let (kind, message) = err.to_error_code();
        assert_eq!(kind, ErrorKind::UpstreamError);
        assert!(message.contains("retry after 42s"), "{message}");
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CapacityExceeded).unwrap();
        assert_eq!(json, "\"capacity_exceeded\"");
    }
}
