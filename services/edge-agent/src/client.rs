//! Control plane API client for the edge agent.
//!
//! Provides methods for communicating with the control plane:
//! - Registering the node and obtaining its identity
//! - Fetching the desired routing state (doubles as a liveness heartbeat)
//! - Best-effort status updates

use anyhow::{Context, Result};
use edgecdn_routing::{DesiredState, RoutingRule};
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::credentials::NodeIdentity;
use crate::error::ClientError;

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.trim_end_matches('/').to_string(),
        })
    }

    /// Register this node and return its identity.
    ///
    /// The control plane keys registration on the caller's network origin,
    /// so calling this again from the same node returns the same identity.
    pub async fn register(&self) -> Result<NodeIdentity, ClientError> {
        let url = format!("{}/register/", self.base_url);
        debug!(url = %url, "Registering node");

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ClientError::RegistrationFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Registration rejected");
            return Err(ClientError::RegistrationFailed(format!(
                "control plane returned {}: {}",
                status, body
            )));
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| ClientError::RegistrationFailed(format!("invalid response: {e}")))?;

        match body.api_key {
            Some(key) if !key.trim().is_empty() => {
                debug!(
                    created = status == StatusCode::CREATED,
                    ip_address = body.ip_address.as_deref().unwrap_or("unknown"),
                    node_status = body.status.as_deref().unwrap_or("unknown"),
                    "Node registered"
                );
                Ok(NodeIdentity::new(key))
            }
            _ => Err(ClientError::RegistrationFailed(
                "API key not found in registration response".to_string(),
            )),
        }
    }

    /// Fetch the desired routing state for this node.
    ///
    /// The control plane marks the node online on every successful fetch.
    /// Rules that fail validation are dropped and logged.
    pub async fn fetch_desired_state(
        &self,
        identity: &NodeIdentity,
    ) -> Result<DesiredState, ClientError> {
        let url = format!("{}/config/", self.base_url);
        debug!(url = %url, "Fetching desired state");

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, api_key_header(identity))
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;

        let response = check_status(response, "Failed to fetch desired state").await?;

        let body: ConfigResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Transient(format!("invalid config response: {e}")))?;

        let fetched = body.websites.len();
        let (state, rejected) = DesiredState::from_rules(body.websites);
        for (rule, reason) in &rejected {
            warn!(
                domain = %rule.domain,
                origin = %rule.origin,
                reason = %reason,
                "Dropping invalid routing rule"
            );
        }

        debug!(
            fetched,
            accepted = state.len(),
            rejected = rejected.len(),
            "Fetched desired state"
        );

        Ok(state)
    }

    /// Report node status to the control plane.
    pub async fn report_status(
        &self,
        identity: &NodeIdentity,
        status: NodeStatus,
    ) -> Result<(), ClientError> {
        let url = format!("{}/config/", self.base_url);
        debug!(status = %status, "Reporting node status");

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, api_key_header(identity))
            .json(&StatusUpdate { status })
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;

        check_status(response, "Failed to report status").await?;
        Ok(())
    }
}

fn api_key_header(identity: &NodeIdentity) -> String {
    format!("ApiKey {}", identity.as_str())
}

/// Map non-2xx responses onto the auth/transient split.
async fn check_status(response: Response, what: &str) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        warn!(status = %status, body = %body, "{what}: identity rejected");
        return Err(ClientError::AuthFailed {
            status: status.as_u16(),
        });
    }

    warn!(status = %status, body = %body, "{what}");
    Err(ClientError::Transient(format!(
        "control plane returned {}: {}",
        status, body
    )))
}

/// Registration response from the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Desired-state response from the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigResponse {
    pub websites: Vec<RoutingRule>,
}

/// Node status values reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Serving the latest desired state.
    Online,
    /// Running, but the latest configuration could not be activated.
    Degraded,
    /// Shutting down.
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Degraded => write!(f, "degraded"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusUpdate {
    status: NodeStatus,
}
