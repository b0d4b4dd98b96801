//! # edgecdn-routing
//!
//! Routing data model and proxy configuration rendering for edge nodes.
//!
//! - **Routing rule**: one `domain -> origin` mapping served by the node.
//! - **Desired state**: the full set of rules from one control-plane fetch.
//! - **Config artifact**: the nginx configuration text derived from a
//!   desired state.
//!
//! # Invariants
//!
//! - Rendering is pure and deterministic: the same set of rules yields
//!   byte-identical output regardless of the order they were fetched in.
//! - The shared cache-path directive is emitted exactly once.
//! - An empty desired state renders to an empty artifact.

mod error;
mod render;
mod rule;

pub use error::RuleError;
pub use render::{render, CacheSettings, ConfigArtifact, RenderOptions};
pub use rule::{DesiredState, RoutingRule};
