//! Routing rules and the desired-state snapshot built from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RuleError;

/// Maximum length of a full hostname.
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single hostname label.
const MAX_LABEL_LEN: usize = 63;

/// Routes requests for `domain` to `origin`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Hostname served by the edge node.
    pub domain: String,

    /// Absolute URL of the upstream origin server.
    #[serde(rename = "origin_server")]
    pub origin: String,
}

impl RoutingRule {
    /// Create a new rule.
    pub fn new(domain: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            origin: origin.into(),
        }
    }

    /// Check that the rule is safe to render into a proxy configuration.
    pub fn validate(&self) -> Result<(), RuleError> {
        validate_domain(&self.domain)?;
        validate_origin(&self.origin)
    }
}

fn validate_domain(domain: &str) -> Result<(), RuleError> {
    if domain.is_empty() {
        return Err(RuleError::EmptyDomain);
    }

    let invalid = |reason| RuleError::InvalidDomain {
        domain: domain.to_string(),
        reason,
    };

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("longer than 253 characters"));
    }

    let host = domain.strip_prefix("*.").unwrap_or(domain);
    for label in host.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with '-'"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("label contains characters other than [A-Za-z0-9-]"));
        }
    }

    Ok(())
}

fn validate_origin(origin: &str) -> Result<(), RuleError> {
    let unsupported = |reason| RuleError::UnsupportedOrigin {
        origin: origin.to_string(),
        reason,
    };

    // The origin is rendered verbatim into a proxy_pass directive.
    if origin
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '$'))
    {
        return Err(unsupported("contains characters not allowed in a proxy directive"));
    }

    let url = Url::parse(origin).map_err(|e| RuleError::InvalidOrigin {
        origin: origin.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(unsupported("scheme must be http or https"));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(unsupported("missing host"));
    }

    Ok(())
}

/// The routing rules a node should serve, as of one fetch.
///
/// Rules are held sorted by domain with at most one rule per domain, so
/// iteration order never depends on the order the control plane returned
/// them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    rules: BTreeMap<String, RoutingRule>,
}

impl DesiredState {
    /// Build a desired state, dropping rules that fail validation and
    /// duplicate domains.
    ///
    /// Returns the accepted state together with every rejected rule and the
    /// reason it was rejected. Domains are compared in lowercase, matching
    /// how nginx compares `server_name`. When several valid rules share a
    /// domain, the one with the lexicographically smallest origin is kept.
    pub fn from_rules(
        rules: impl IntoIterator<Item = RoutingRule>,
    ) -> (Self, Vec<(RoutingRule, RuleError)>) {
        let mut sorted: Vec<RoutingRule> = rules
            .into_iter()
            .map(|mut rule| {
                rule.domain.make_ascii_lowercase();
                rule
            })
            .collect();
        sorted.sort();

        let mut accepted = BTreeMap::new();
        let mut rejected = Vec::new();

        for rule in sorted {
            if let Err(e) = rule.validate() {
                rejected.push((rule, e));
                continue;
            }
            if accepted.contains_key(&rule.domain) {
                let domain = rule.domain.clone();
                rejected.push((rule, RuleError::DuplicateDomain(domain)));
                continue;
            }
            accepted.insert(rule.domain.clone(), rule);
        }

        (Self { rules: accepted }, rejected)
    }

    /// Rules in domain order.
    pub fn rules(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.values()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there is nothing to route.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
