//! Error types for the edge agent.

use std::path::PathBuf;

use thiserror::Error;

/// Control-plane call failures.
///
/// Auth failures and transient failures are kept apart: an auth failure
/// means the stored identity was rejected and the node must register again,
/// a transient failure means the identity is still good and the call should
/// simply be retried later.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Registration did not yield an identity.
    #[error("registration_failed: {0}")]
    RegistrationFailed(String),

    /// The control plane rejected the node identity.
    #[error("auth_failed: control plane returned {status}")]
    AuthFailed { status: u16 },

    /// Network error, timeout, 5xx or malformed response.
    #[error("transient_failure: {0}")]
    Transient(String),
}

impl ClientError {
    /// Returns true if the identity was rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ClientError::AuthFailed { .. })
    }

    /// Stable label for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ClientError::RegistrationFailed(_) => "registration_failed",
            ClientError::AuthFailed { .. } => "auth_failed",
            ClientError::Transient(_) => "transient_failure",
        }
    }
}

/// Credential file failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CredentialError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CredentialError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            ClientError::RegistrationFailed("x".into()).reason_code(),
            "registration_failed"
        );
        assert_eq!(
            ClientError::AuthFailed { status: 403 }.reason_code(),
            "auth_failed"
        );
        assert_eq!(
            ClientError::Transient("x".into()).reason_code(),
            "transient_failure"
        );
    }

    #[test]
    fn test_only_auth_failed_is_auth_failure() {
        assert!(ClientError::AuthFailed { status: 401 }.is_auth_failure());
        assert!(!ClientError::Transient("503".into()).is_auth_failure());
        assert!(!ClientError::RegistrationFailed("x".into()).is_auth_failure());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::AuthFailed { status: 403 };
        assert_eq!(err.to_string(), "auth_failed: control plane returned 403");
    }
}
