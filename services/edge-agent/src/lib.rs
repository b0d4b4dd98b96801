//! edgecdn Edge Agent Library
//!
//! The edge agent runs on each CDN edge node next to nginx. It keeps the
//! local proxy configuration in sync with the routing rules held by the
//! control plane.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler
//! ├── CredentialStore      (node identity on disk)
//! ├── ControlPlaneClient   (register, fetch desired state, status)
//! ├── render()             (desired state -> nginx config, edgecdn-routing)
//! └── ProxyApplier         (stage, activate, validate, reload or roll back)
//!     └── ProxyControl     (nginx -t / systemctl reload nginx)
//! ```
//!
//! ## Modules
//!
//! - `applier`: Safe activation of generated configuration
//! - `client`: Control plane HTTP client
//! - `credentials`: Node identity persistence
//! - `proxy`: Proxy control interface and command-backed implementation
//! - `reconciler`: The control loop

pub mod applier;
pub mod backoff;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;
pub mod reconciler;

// Re-export commonly used types
pub use applier::{ApplyOutcome, ProxyApplier};
pub use client::{ControlPlaneClient, NodeStatus};
pub use config::{Config, EmptyStatePolicy};
pub use credentials::{CredentialStore, NodeIdentity};
pub use error::{ClientError, CredentialError};
pub use proxy::{CommandProxyControl, MockProxyControl, ProxyControl};
pub use reconciler::{AgentState, CycleReport, Reconciler};
