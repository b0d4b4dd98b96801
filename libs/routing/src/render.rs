//! Rendering a desired state into an nginx configuration artifact.

use std::fmt;

use crate::rule::{DesiredState, RoutingRule};

/// Generated proxy configuration text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigArtifact(String);

impl ConfigArtifact {
    /// Wrap already-rendered configuration text.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// An empty artifact means there is nothing to route.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ConfigArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared response cache settings, emitted once per artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// On-disk cache directory.
    pub path: String,
    /// Name of the shared memory zone referenced by every server block.
    pub zone_name: String,
    /// Directory hierarchy levels.
    pub levels: String,
    /// Shared memory size for cache keys.
    pub keys_zone_size: String,
    /// Maximum on-disk cache size.
    pub max_size: String,
    /// Entries not accessed within this window are evicted.
    pub inactive: String,
    /// TTL for 200 and 302 responses.
    pub success_ttl: String,
    /// TTL for 404 responses.
    pub not_found_ttl: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: "/var/cache/nginx".to_string(),
            zone_name: "cdn_cache".to_string(),
            levels: "1:2".to_string(),
            keys_zone_size: "10m".to_string(),
            max_size: "10g".to_string(),
            inactive: "60m".to_string(),
            success_ttl: "60m".to_string(),
            not_found_ttl: "1m".to_string(),
        }
    }
}

/// Knobs for [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Port every server block listens on.
    pub listen_port: u16,
    /// Response cache settings.
    pub cache: CacheSettings,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            listen_port: 80,
            cache: CacheSettings::default(),
        }
    }
}

/// Render a desired state into nginx configuration.
///
/// The output depends only on the set of rules, never on fetch order, so
/// an unchanged desired state always produces byte-identical text. An empty
/// desired state renders to an empty artifact.
pub fn render(state: &DesiredState, options: &RenderOptions) -> ConfigArtifact {
    if state.is_empty() {
        return ConfigArtifact::default();
    }

    let cache = &options.cache;
    let mut out = String::new();
    out.push_str("# Generated by edge-agent. Local changes are overwritten.\n");
    out.push_str(&format!(
        "proxy_cache_path {} levels={} keys_zone={}:{} \
         max_size={} inactive={} use_temp_path=off;\n",
        cache.path,
        cache.levels,
        cache.zone_name,
        cache.keys_zone_size,
        cache.max_size,
        cache.inactive
    ));

    for rule in state.rules() {
        out.push('\n');
        write_server_block(&mut out, rule, options);
    }

    ConfigArtifact(out)
}

fn write_server_block(out: &mut String, rule: &RoutingRule, options: &RenderOptions) {
    let cache = &options.cache;
    out.push_str("server {\n");
    out.push_str(&format!("    listen {};\n", options.listen_port));
    out.push_str(&format!("    server_name {};\n", rule.domain));
    out.push('\n');
    out.push_str("    location / {\n");
    out.push_str(&format!("        proxy_pass {};\n", rule.origin));
    out.push_str("        proxy_set_header Host $host;\n");
    out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
    out.push('\n');
    out.push_str(&format!("        proxy_cache {};\n", cache.zone_name));
    out.push_str(&format!("        proxy_cache_valid 200 302 {};\n", cache.success_ttl));
    out.push_str(&format!("        proxy_cache_valid 404 {};\n", cache.not_found_ttl));
    out.push_str("        add_header X-Cache-Status $upstream_cache_status;\n");
    out.push_str("    }\n");
    out.push_str("}\n");
}
