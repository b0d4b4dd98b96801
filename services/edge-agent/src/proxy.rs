//! Reverse-proxy control interface and implementations.
//!
//! The control interface abstracts the two operations the agent needs from
//! the running proxy:
//! - Syntax-checking the configuration on disk
//! - Gracefully reloading it
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{CommandSpec, ProxyConfig};

/// Reverse-proxy control interface.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Check the configuration currently on disk.
    async fn validate(&self) -> Result<()>;

    /// Make the running proxy adopt the configuration on disk without
    /// dropping connections.
    async fn reload(&self) -> Result<()>;
}

/// Drives the proxy through external commands (`nginx -t`,
/// `systemctl reload nginx`).
pub struct CommandProxyControl {
    validate_command: CommandSpec,
    reload_command: CommandSpec,
    timeout: Duration,
}

impl CommandProxyControl {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            validate_command: config.validate_command.clone(),
            reload_command: config.reload_command.clone(),
            timeout: config.command_timeout,
        }
    }
}

#[async_trait]
impl ProxyControl for CommandProxyControl {
    async fn validate(&self) -> Result<()> {
        info!(command = %self.validate_command, "Testing proxy configuration");
        run_command(&self.validate_command, self.timeout).await
    }

    async fn reload(&self) -> Result<()> {
        info!(command = %self.reload_command, "Reloading proxy");
        run_command(&self.reload_command, self.timeout).await
    }
}

/// Run a command to completion, failing on non-zero exit or timeout.
///
/// The child is killed if the timeout elapses.
async fn run_command(spec: &CommandSpec, timeout: Duration) -> Result<()> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args).kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => {
            result.map_err(|e| anyhow::anyhow!("failed to execute {}: {}", spec.program, e))?
        }
        Err(_) => anyhow::bail!("{} timed out after {}s", spec, timeout.as_secs()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} failed ({}): {}", spec, output.status, stderr.trim());
    }

    debug!(command = %spec, "Command succeeded");
    Ok(())
}

/// Mock proxy for testing and development.
///
/// Records every invocation and can be told to fail either step.
#[derive(Default)]
pub struct MockProxyControl {
    validate_calls: AtomicUsize,
    reload_calls: AtomicUsize,
    fail_validate: AtomicBool,
    fail_reload: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
}

impl MockProxyControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose validation always fails.
    pub fn rejecting() -> Self {
        let mock = Self::new();
        mock.set_fail_validate(true);
        mock
    }

    /// Create a mock whose reload always fails.
    pub fn failing_reload() -> Self {
        let mock = Self::new();
        mock.set_fail_reload(true);
        mock
    }

    pub fn set_fail_validate(&self, fail: bool) {
        self.fail_validate.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn reload_calls(&self) -> usize {
        self.reload_calls.load(Ordering::SeqCst)
    }

    /// Invocations in order, as `"validate"` / `"reload"`.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl ProxyControl for MockProxyControl {
    async fn validate(&self) -> Result<()> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.record("validate");
        debug!("[MOCK] Validating proxy configuration");

        if self.fail_validate.load(Ordering::SeqCst) {
            anyhow::bail!("[MOCK] configuration test failed");
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reload_calls.fetch_add(1, Ordering::SeqCst);
        self.record("reload");
        debug!("[MOCK] Reloading proxy");

        if self.fail_reload.load(Ordering::SeqCst) {
            anyhow::bail!("[MOCK] reload failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(line: &str) -> CommandSpec {
        CommandSpec::parse(line).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_success() {
        run_command(&spec("true"), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_non_zero_exit() {
        let err = run_command(&spec("false"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("false failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout() {
        let err = run_command(&spec("sleep 5"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let err = run_command(
            &spec("definitely-not-a-real-binary-edgecdn"),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to execute"));
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockProxyControl::new();
        mock.validate().await.unwrap();
        mock.reload().await.unwrap();

        assert_eq!(mock.validate_calls(), 1);
        assert_eq!(mock.reload_calls(), 1);
        assert_eq!(mock.calls(), ["validate", "reload"]);
    }

    #[tokio::test]
    async fn test_mock_failures() {
        assert!(MockProxyControl::rejecting().validate().await.is_err());
        assert!(MockProxyControl::failing_reload().reload().await.is_err());
    }
}
