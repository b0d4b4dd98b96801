//! Reconciliation loop for converging the local proxy onto desired state.
//!
//! The reconciler:
//! - Obtains the node identity (stored, or by registering)
//! - Periodically fetches the desired routing state
//! - Renders it and hands the artifact to the applier
//! - Re-registers when the control plane rejects the identity
//!
//! Cycles run strictly one at a time. Shutdown is only observed between
//! cycles, never in the middle of an apply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use edgecdn_routing::{render, RenderOptions};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::applier::{ApplyOutcome, ProxyApplier};
use crate::backoff::BackoffPolicy;
use crate::client::{ControlPlaneClient, NodeStatus};
use crate::config::Config;
use crate::credentials::{CredentialStore, NodeIdentity};
use crate::proxy::ProxyControl;

/// Whether the agent currently holds an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Registered(NodeIdentity),
}

/// What happened in one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// Desired state was fetched and handed to the applier.
    Reconciled {
        domain_count: usize,
        outcome: ApplyOutcome,
    },
    /// The control plane rejected the identity; re-register next cycle.
    AuthRejected,
    /// Fetch failed transiently; the proxy was not touched.
    FetchFailed(String),
    /// Re-registration failed; still unregistered.
    RegistrationFailed(String),
    /// The cycle ran, but the identity in use is not yet on disk.
    CredentialSaveFailed {
        reason: String,
        domain_count: usize,
        outcome: ApplyOutcome,
    },
}

impl CycleReport {
    /// Whether the cycle counts as a failure for backoff purposes.
    pub fn is_failure(&self) -> bool {
        match self {
            CycleReport::Reconciled { outcome, .. } => outcome.is_failure(),
            _ => true,
        }
    }
}

/// Reconciler for converging proxy configuration.
pub struct Reconciler {
    /// Control plane client.
    client: ControlPlaneClient,

    /// Identity persistence.
    store: CredentialStore,

    /// Proxy configuration applier.
    applier: ProxyApplier,

    render_options: RenderOptions,
    backoff: BackoffPolicy,
    state: AgentState,
    /// Set when the identity in `state` still has to be written to the store.
    identity_unsaved: bool,
    consecutive_failures: u32,
}

impl Reconciler {
    /// Create a new reconciler. Starts unregistered.
    pub fn new(config: &Config, control: Arc<dyn ProxyControl>) -> Result<Self> {
        Ok(Self {
            client: ControlPlaneClient::new(config)?,
            store: CredentialStore::new(&config.credentials_path),
            applier: ProxyApplier::new(&config.proxy, control),
            render_options: config.render.clone(),
            backoff: BackoffPolicy::new(config.reconcile_interval, config.backoff_max),
            state: AgentState::Unregistered,
            identity_unsaved: false,
            consecutive_failures: 0,
        })
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Obtain an identity before the loop starts.
    ///
    /// Uses the stored identity if there is one, otherwise registers and
    /// persists the result. Any failure here is fatal for the process.
    pub async fn bootstrap(&mut self) -> Result<()> {
        match self.store.load() {
            Ok(Some(identity)) => {
                info!(path = %self.store.path().display(), "Loaded node identity");
                self.state = AgentState::Registered(identity);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable credential file, registering again");
            }
        }

        info!("No stored identity, registering node");
        let identity = self
            .client
            .register()
            .await
            .context("Failed to register node")?;
        self.store
            .save(&identity)
            .context("Failed to persist node identity")?;

        info!("Node registered successfully");
        self.state = AgentState::Registered(identity);
        Ok(())
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let stored = match &self.state {
            AgentState::Registered(identity) => Some(identity.clone()),
            AgentState::Unregistered => None,
        };
        let identity = match stored {
            Some(identity) => identity,
            None => match self.reregister().await {
                Ok(identity) => identity,
                Err(reason) => return CycleReport::RegistrationFailed(reason),
            },
        };
        let save_error = self.persist_identity(&identity);

        debug!("Fetching latest configuration");
        let desired = match self.client.fetch_desired_state(&identity).await {
            Ok(desired) => desired,
            Err(e) if e.is_auth_failure() => {
                warn!(reason = %e, "Identity rejected, will register again");
                self.state = AgentState::Unregistered;
                return CycleReport::AuthRejected;
            }
            Err(e) => return CycleReport::FetchFailed(e.to_string()),
        };

        let domain_count = desired.len();
        let artifact = render(&desired, &self.render_options);
        let outcome = self.applier.apply(&artifact).await;

        if matches!(
            outcome,
            ApplyOutcome::ValidationFailed(_) | ApplyOutcome::ReloadFailed(_)
        ) {
            self.report_status(&identity, NodeStatus::Degraded).await;
        }

        match save_error {
            Some(reason) => CycleReport::CredentialSaveFailed {
                reason,
                domain_count,
                outcome,
            },
            None => CycleReport::Reconciled {
                domain_count,
                outcome,
            },
        }
    }

    /// Register again after the identity was rejected.
    ///
    /// The new identity is used right away; writing it to the store is left
    /// to [`Self::persist_identity`] so a failed write is retried every cycle.
    async fn reregister(&mut self) -> Result<NodeIdentity, String> {
        info!("Registering node");
        let identity = self.client.register().await.map_err(|e| e.to_string())?;

        info!("Node re-registered");
        self.state = AgentState::Registered(identity.clone());
        self.identity_unsaved = true;
        Ok(identity)
    }

    /// Write a not yet persisted identity to the store. Returns the failure
    /// reason if it is still unsaved afterwards.
    fn persist_identity(&mut self, identity: &NodeIdentity) -> Option<String> {
        if !self.identity_unsaved {
            return None;
        }

        match self.store.save(identity) {
            Ok(()) => {
                info!(path = %self.store.path().display(), "Persisted node identity");
                self.identity_unsaved = false;
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to persist node identity, retrying next cycle");
                Some(e.to_string())
            }
        }
    }

    async fn report_status(&self, identity: &NodeIdentity, status: NodeStatus) {
        if let Err(e) = self.client.report_status(identity, status).await {
            debug!(status = %status, error = %e, "Status report failed (ignored)");
        }
    }

    /// Record a cycle's outcome and return the delay before the next one.
    pub fn record(&mut self, report: &CycleReport) -> Duration {
        if report.is_failure() {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else {
            self.consecutive_failures = 0;
        }
        self.backoff.delay(self.consecutive_failures)
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.backoff.base.as_secs(),
            backoff_max_secs = self.backoff.max.as_secs(),
            "Starting reconciliation loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_cycle().await;
            let delay = self.record(&report);
            log_cycle(&report, self.consecutive_failures, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler shutting down");
        if let AgentState::Registered(identity) = &self.state {
            self.report_status(identity, NodeStatus::Offline).await;
        }
    }
}

fn log_cycle(report: &CycleReport, consecutive_failures: u32, delay: Duration) {
    let next_delay_secs = delay.as_secs();
    match report {
        CycleReport::Reconciled {
            domain_count,
            outcome,
        } => {
            if let Some(reason) = outcome.reason() {
                error!(
                    phase = "apply",
                    outcome = outcome.label(),
                    reason,
                    domain_count,
                    consecutive_failures,
                    next_delay_secs,
                    "Reconciliation failed"
                );
            } else if *outcome == ApplyOutcome::Skipped {
                warn!(
                    phase = "apply",
                    outcome = outcome.label(),
                    next_delay_secs,
                    "No websites to configure, proxy configuration unchanged"
                );
            } else {
                info!(
                    phase = "apply",
                    outcome = outcome.label(),
                    domain_count,
                    next_delay_secs,
                    "Reconciliation complete"
                );
            }
        }
        CycleReport::AuthRejected => warn!(
            phase = "fetch",
            outcome = "auth_rejected",
            consecutive_failures,
            next_delay_secs,
            "Node identity rejected, re-registering next cycle"
        ),
        CycleReport::FetchFailed(reason) => warn!(
            phase = "fetch",
            outcome = "fetch_failed",
            reason = %reason,
            consecutive_failures,
            next_delay_secs,
            "Could not retrieve desired state, keeping current configuration"
        ),
        CycleReport::CredentialSaveFailed {
            reason,
            domain_count,
            outcome,
        } => error!(
            phase = "persist",
            outcome = "credential_save_failed",
            apply_outcome = outcome.label(),
            reason = %reason,
            domain_count,
            consecutive_failures,
            next_delay_secs,
            "Node identity not persisted"
        ),
        CycleReport::RegistrationFailed(reason) => error!(
            phase = "register",
            outcome = "registration_failed",
            reason = %reason,
            consecutive_failures,
            next_delay_secs,
            "Re-registration failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_report_failure_classification() {
        let ok = CycleReport::Reconciled {
            domain_count: 1,
            outcome: ApplyOutcome::Applied,
        };
        let skipped = CycleReport::Reconciled {
            domain_count: 0,
            outcome: ApplyOutcome::Skipped,
        };
        let rejected = CycleReport::Reconciled {
            domain_count: 1,
            outcome: ApplyOutcome::ValidationFailed("bad".into()),
        };

        assert!(!ok.is_failure());
        assert!(!skipped.is_failure());
        assert!(rejected.is_failure());
        assert!(CycleReport::FetchFailed("503".into()).is_failure());
        assert!(CycleReport::AuthRejected.is_failure());
        assert!(CycleReport::CredentialSaveFailed {
            reason: "read-only file system".into(),
            domain_count: 1,
            outcome: ApplyOutcome::Applied,
        }
        .is_failure());
    }
}
