//! Configuration for the edge agent.
//!
//! Built once at startup from the control-plane URL (the only CLI argument)
//! and `EDGE_*` environment overrides, then passed by reference into every
//! component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use edgecdn_routing::{CacheSettings, RenderOptions};
use url::Url;

/// What to do when the control plane returns no routing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyStatePolicy {
    /// Keep the active proxy configuration untouched.
    #[default]
    Preserve,
    /// Activate an empty configuration, removing every route.
    Deprovision,
}

impl FromStr for EmptyStatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" => Ok(Self::Preserve),
            "deprovision" => Ok(Self::Deprovision),
            other => bail!(
                "unknown empty state policy '{other}' (expected preserve or deprovision)"
            ),
        }
    }
}

/// An external command split into program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Split a command line on whitespace.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().context("command cannot be empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Local reverse-proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Generated configuration file ("sites-available").
    pub available_path: PathBuf,

    /// Link the proxy loads configuration from ("sites-enabled").
    pub enabled_path: PathBuf,

    /// Syntax check command.
    pub validate_command: CommandSpec,

    /// Graceful reload command.
    pub reload_command: CommandSpec,

    /// Upper bound on each validate/reload invocation.
    pub command_timeout: Duration,

    /// Behavior for an empty desired state.
    pub empty_state_policy: EmptyStatePolicy,
}

/// Edge agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane API base URL, without trailing slash.
    pub control_plane_url: String,

    /// Where the node identity is persisted.
    pub credentials_path: PathBuf,

    /// Reverse-proxy paths and commands.
    pub proxy: ProxyConfig,

    /// Rendering knobs for the generated configuration.
    pub render: RenderOptions,

    /// Sleep between reconciliation cycles.
    pub reconcile_interval: Duration,

    /// Timeout for each control-plane request.
    pub request_timeout: Duration,

    /// Ceiling for the retry delay after consecutive failures.
    pub backoff_max: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env(control_plane_url: &str) -> Result<Self> {
        Self::from_lookup(control_plane_url, |key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to resolve `EDGE_*` variables.
    pub fn from_lookup<F>(control_plane_url: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let control_plane_url = parse_base_url(control_plane_url)?;

        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let secs = |key: &str, default: u64| -> Result<Duration> {
            let value: u64 = lookup(key)
                .map(|v| v.parse())
                .transpose()
                .with_context(|| format!("{key} must be an integer (seconds)."))?
                .unwrap_or(default);
            if value == 0 {
                bail!("{key} must be greater than zero.");
            }
            Ok(Duration::from_secs(value))
        };

        let command = |key: &str, default: &str| -> Result<CommandSpec> {
            let line = lookup(key).unwrap_or_else(|| default.to_string());
            CommandSpec::parse(&line).with_context(|| format!("{key} is invalid."))
        };

        let empty_state_policy = lookup("EDGE_EMPTY_STATE_POLICY")
            .map(|v| v.parse())
            .transpose()
            .context("EDGE_EMPTY_STATE_POLICY is invalid.")?
            .unwrap_or_default();

        let listen_port: u16 = lookup("EDGE_LISTEN_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("EDGE_LISTEN_PORT must be a port number.")?
            .unwrap_or(80);

        let mut cache = CacheSettings::default();
        if let Some(cache_path) = lookup("EDGE_CACHE_PATH") {
            cache.path = cache_path;
        }

        let reconcile_interval = secs("EDGE_RECONCILE_INTERVAL_SECS", 60)?;
        let backoff_max = secs("EDGE_BACKOFF_MAX_SECS", 600)?.max(reconcile_interval);

        Ok(Self {
            control_plane_url,
            credentials_path: path("EDGE_CREDENTIALS_PATH", "/etc/cdn-agent/agent.conf"),
            proxy: ProxyConfig {
                available_path: path(
                    "EDGE_PROXY_AVAILABLE_PATH",
                    "/etc/nginx/sites-available/cdn.conf",
                ),
                enabled_path: path(
                    "EDGE_PROXY_ENABLED_PATH",
                    "/etc/nginx/sites-enabled/cdn.conf",
                ),
                validate_command: command("EDGE_PROXY_VALIDATE_CMD", "nginx -t")?,
                reload_command: command("EDGE_PROXY_RELOAD_CMD", "systemctl reload nginx")?,
                command_timeout: secs("EDGE_COMMAND_TIMEOUT_SECS", 30)?,
                empty_state_policy,
            },
            render: RenderOptions { listen_port, cache },
            reconcile_interval,
            request_timeout: secs("EDGE_REQUEST_TIMEOUT_SECS", 10)?,
            backoff_max,
            log_level: lookup("EDGE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .with_context(|| format!("control plane URL '{raw}' is not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        bail!("control plane URL '{raw}' must be an absolute http(s) URL");
    }
    Ok(trimmed.to_string())
}
