//! Activating a rendered configuration on the local proxy.
//!
//! Each step gates the next:
//! 1. Skip empty artifacts (unless configured to deprovision)
//! 2. Write to a staging file next to the active one
//! 3. Rename the staging file over the active path
//! 4. Create the "enabled" link if it is missing
//! 5. Validate; on failure restore the previous file
//! 6. Reload
//!
//! No retries happen here; the reconciler owns retry policy.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use edgecdn_routing::ConfigArtifact;
use tracing::{debug, error, info, warn};

use crate::config::{EmptyStatePolicy, ProxyConfig};
use crate::proxy::ProxyControl;

/// Outcome of one apply attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New configuration is live.
    Applied,
    /// Identical to what was last made live; nothing was touched.
    Unchanged,
    /// Empty desired state; the active configuration was left as is.
    Skipped,
    /// The proxy rejected the configuration; the previous file was restored.
    ValidationFailed(String),
    /// The configuration is on disk but the proxy did not reload it.
    ReloadFailed(String),
    /// Writing the configuration failed.
    IoFailed(String),
}

impl ApplyOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::ValidationFailed(_)
                | ApplyOutcome::ReloadFailed(_)
                | ApplyOutcome::IoFailed(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Skipped => "skipped",
            ApplyOutcome::ValidationFailed(_) => "validation_failed",
            ApplyOutcome::ReloadFailed(_) => "reload_failed",
            ApplyOutcome::IoFailed(_) => "io_failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ApplyOutcome::ValidationFailed(reason)
            | ApplyOutcome::ReloadFailed(reason)
            | ApplyOutcome::IoFailed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Writes, validates and reloads proxy configuration.
pub struct ProxyApplier {
    available_path: PathBuf,
    enabled_path: PathBuf,
    empty_state_policy: EmptyStatePolicy,
    control: Arc<dyn ProxyControl>,
    /// Last artifact this process successfully reloaded.
    last_applied: Option<ConfigArtifact>,
}

impl ProxyApplier {
    pub fn new(config: &ProxyConfig, control: Arc<dyn ProxyControl>) -> Self {
        Self {
            available_path: config.available_path.clone(),
            enabled_path: config.enabled_path.clone(),
            empty_state_policy: config.empty_state_policy,
            control,
            last_applied: None,
        }
    }

    /// Path of the staging file used for atomic replacement.
    pub fn staging_path(&self) -> PathBuf {
        staging_path_for(&self.available_path)
    }

    /// Apply an artifact to the proxy.
    pub async fn apply(&mut self, artifact: &ConfigArtifact) -> ApplyOutcome {
        if artifact.is_empty() && self.empty_state_policy == EmptyStatePolicy::Preserve {
            debug!("Empty artifact, leaving active configuration untouched");
            return ApplyOutcome::Skipped;
        }

        if self.is_unchanged(artifact) {
            debug!("Artifact matches live configuration");
            return ApplyOutcome::Unchanged;
        }

        let previous = match read_optional(&self.available_path) {
            Ok(previous) => previous,
            Err(e) => {
                return ApplyOutcome::IoFailed(format!(
                    "failed to read {}: {}",
                    self.available_path.display(),
                    e
                ))
            }
        };

        if let Err(e) = write_atomic(&self.available_path, artifact.as_bytes()) {
            return ApplyOutcome::IoFailed(format!(
                "failed to write {}: {}",
                self.available_path.display(),
                e
            ));
        }
        debug!(
            path = %self.available_path.display(),
            bytes = artifact.len(),
            "Wrote proxy configuration"
        );

        let link_created = match ensure_link(&self.available_path, &self.enabled_path) {
            Ok(created) => created,
            Err(e) => {
                let reason = format!(
                    "failed to enable {}: {}",
                    self.enabled_path.display(),
                    e
                );
                return ApplyOutcome::IoFailed(self.restore(previous.as_deref(), false, reason));
            }
        };

        if let Err(e) = self.control.validate().await {
            let reason = format!("{e:#}");
            warn!(reason = %reason, "Proxy configuration test failed");
            return ApplyOutcome::ValidationFailed(self.restore(
                previous.as_deref(),
                link_created,
                reason,
            ));
        }

        if let Err(e) = self.control.reload().await {
            let reason = format!("{e:#}");
            error!(reason = %reason, "Failed to reload proxy");
            return ApplyOutcome::ReloadFailed(reason);
        }

        info!(bytes = artifact.len(), "Proxy reloaded successfully");
        self.last_applied = Some(artifact.clone());
        ApplyOutcome::Applied
    }

    fn is_unchanged(&self, artifact: &ConfigArtifact) -> bool {
        if self.last_applied.as_ref() != Some(artifact) {
            return false;
        }
        if fs::symlink_metadata(&self.enabled_path).is_err() {
            return false;
        }
        matches!(
            read_optional(&self.available_path),
            Ok(Some(bytes)) if bytes == artifact.as_bytes()
        )
    }

    /// Put the previous configuration back after a failed activation.
    ///
    /// When there was no previous file, the new file is removed, along with
    /// the enabled link if this attempt created it, so the proxy is never
    /// left including a dangling link. Returns `reason`, extended with the
    /// restore error if that failed too.
    fn restore(&self, previous: Option<&[u8]>, link_created: bool, reason: String) -> String {
        let result = match previous {
            Some(bytes) => write_atomic(&self.available_path, bytes),
            None => remove_if_present(&self.available_path).and_then(|()| {
                if link_created {
                    remove_if_present(&self.enabled_path)
                } else {
                    Ok(())
                }
            }),
        };

        match result {
            Ok(()) => {
                info!(
                    path = %self.available_path.display(),
                    had_previous = previous.is_some(),
                    "Restored previous proxy configuration"
                );
                reason
            }
            Err(e) => {
                error!(
                    path = %self.available_path.display(),
                    error = %e,
                    "Failed to restore previous proxy configuration"
                );
                format!("{reason} (restore failed: {e})")
            }
        }
    }
}

fn staging_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".staging");
    path.with_file_name(name)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace `path` with `contents` via a staging file and rename.
///
/// Readers of `path` see either the old or the new contents, never a
/// partial write.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let staging = staging_path_for(path);
    let written = fs::File::create(&staging).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    fs::rename(&staging, path).inspect_err(|_| {
        let _ = fs::remove_file(&staging);
    })
}

/// Create the enabled link pointing at `target` unless something is already
/// there. Returns whether a link was created.
fn ensure_link(target: &Path, link: &Path) -> std::io::Result<bool> {
    match fs::symlink_metadata(link) {
        Ok(_) => return Ok(false),
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
        Err(_) => {}
    }

    if let Some(parent) = link.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)?;
    }

    #[cfg(not(unix))]
    {
        fs::write(link, format!("include {};\n", target.display()))?;
    }

    info!(link = %link.display(), target = %target.display(), "Enabled proxy configuration");
    Ok(true)
}
