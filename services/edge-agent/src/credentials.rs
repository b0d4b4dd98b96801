//! Node identity persistence.
//!
//! The identity is issued once by the control plane and stored on local
//! disk so it survives restarts. The agent never generates one itself.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CredentialError;

/// Opaque credential the node presents to the control plane.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep the key out of logs.
impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeIdentity(<redacted>)")
    }
}

/// On-disk credential file format.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    api_key: String,
}

/// Reads and writes the node identity file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored identity.
    ///
    /// Returns `None` if the file does not exist or holds an empty key.
    pub fn load(&self) -> Result<Option<NodeIdentity>, CredentialError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential file");
                return Ok(None);
            }
            Err(e) => return Err(CredentialError::io(&self.path, e)),
        };

        let file: CredentialFile =
            serde_json::from_str(&contents).map_err(|source| CredentialError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if file.api_key.trim().is_empty() {
            warn!(path = %self.path.display(), "Credential file has an empty api_key");
            return Ok(None);
        }

        Ok(Some(NodeIdentity(file.api_key)))
    }

    /// Persist the identity, replacing any previous one.
    ///
    /// Writes to a sibling temp file and renames it into place, so a crash
    /// never leaves a truncated credential file behind.
    pub fn save(&self, identity: &NodeIdentity) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| CredentialError::io(parent, e))?;
            }
        }

        let contents = serde_json::to_string(&CredentialFile {
            api_key: identity.0.clone(),
        })
        .map_err(|source| CredentialError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        if let Err(e) = write_private(&tmp_path, contents.as_bytes()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(CredentialError::io(&tmp_path, e));
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CredentialError::io(&self.path, e)
        })?;

        info!(path = %self.path.display(), "Saved node identity");
        Ok(())
    }
}

/// Write `contents` to `path`, readable only by the owner on Unix.
///
/// The handle is flushed to disk and closed before returning, on every path.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("agent.conf"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_creates_parent_and_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/cdn-agent/agent.conf");
        let store = CredentialStore::new(&path);

        store.save(&NodeIdentity::new("abc-123")).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, r#"{"api_key":"abc-123"}"#);
        assert_eq!(store.load().unwrap(), Some(NodeIdentity::new("abc-123")));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_identity() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("agent.conf"));

        store.save(&NodeIdentity::new("old")).unwrap();
        store.save(&NodeIdentity::new("new")).unwrap();

        assert_eq!(store.load().unwrap(), Some(NodeIdentity::new("new")));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.conf");
        CredentialStore::new(&path)
            .save(&NodeIdentity::new("abc-123"))
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.conf");
        fs::write(&path, "not json").unwrap();

        let err = CredentialStore::new(&path).load().unwrap_err();
        assert!(matches!(err, CredentialError::Parse { .. }));
    }

    #[test]
    fn test_load_empty_key_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.conf");
        fs::write(&path, r#"{"api_key":""}"#).unwrap();

        assert!(CredentialStore::new(&path).load().unwrap().is_none());
    }

    #[test]
    fn test_identity_debug_is_redacted() {
        let identity = NodeIdentity::new("super-secret");
        assert!(!format!("{identity:?}").contains("super-secret"));
    }
}
