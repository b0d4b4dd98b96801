//! Error types for routing rule validation.

use thiserror::Error;

/// Reasons a routing rule is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// The domain is empty.
    #[error("domain cannot be empty")]
    EmptyDomain,

    /// The domain is not a valid hostname.
    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: &'static str },

    /// Another rule already routes this domain.
    #[error("duplicate domain '{0}'")]
    DuplicateDomain(String),

    /// The origin could not be parsed as a URL.
    #[error("invalid origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    /// The origin parsed but is not an absolute http(s) URL with a host.
    #[error("unsupported origin '{origin}': {reason}")]
    UnsupportedOrigin { origin: String, reason: &'static str },
}

impl RuleError {
    /// Returns true if the domain half of the rule was rejected.
    pub fn is_domain_error(&self) -> bool {
        matches!(
            self,
            RuleError::EmptyDomain
                | RuleError::InvalidDomain { .. }
                | RuleError::DuplicateDomain(_)
        )
    }
}
