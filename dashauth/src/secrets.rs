//! Secret records backing the authentication configuration.
//!
//! A [`Secret`] is a flat map of keys to raw bytes, the same shape as a Kubernetes `Secret`.
//! Two stores ship with the crate:
//!
//! - [`DirectorySecretStore`] reads secrets laid out the way the kubelet mounts them: one
//!   directory per secret under a root, one file per key.
//! - [`MemorySecretStore`] keeps secrets in memory, for tests and embedding.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{collections::BTreeMap, fmt, path::PathBuf};
use tracing::{debug, instrument};

use crate::errors::{Error, Result};

/// A key-value secret record.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Value of `key` as a string, empty when absent.
    pub fn get_string(&self, key: &str) -> String {
        self.get(key).map(|v| String::from_utf8_lossy(v).into_owned()).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for Secret {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

// Values stay out of logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("keys", &self.data.keys().collect::<Vec<_>>()).finish()
    }
}

/// Lookup of secrets by name.
#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Returns `Ok(None)` when no secret with that name exists.
    async fn get(&self, name: &str) -> Result<Option<Secret>>;
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, Secret>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, secret: Secret) {
        self.secrets.insert(name.into(), secret);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets.get(name).map(|s| s.clone()))
    }
}

/// Secrets mounted as `<root>/<name>/<key>` files.
///
/// Entries whose names start with `.` are skipped; the kubelet uses `..data` and timestamped
/// dot-directories to swap secret contents atomically.
#[derive(Debug, Clone)]
pub struct DirectorySecretStore {
    root: PathBuf,
}

impl DirectorySecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<Option<Secret>> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(Error::BadRequest {
                message: format!("invalid secret name {name:?}"),
            });
        }

        let dir = self.root.join(name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %dir.display(), "secret directory not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::Internal {
                    operation: format!("read secret directory {}: {e}", dir.display()),
                });
            }
        };

        let mut secret = Secret::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::Internal {
            operation: format!("list secret directory {}: {e}", dir.display()),
        })? {
            let key = entry.file_name().to_string_lossy().into_owned();
            if key.starts_with('.') {
                continue;
            }

            // Follows symlinks, which is how mounted keys are exposed.
            let path = entry.path();
            let is_file = tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }

            let value = tokio::fs::read(&path).await.map_err(|e| Error::Internal {
                operation: format!("read secret key {}: {e}", path.display()),
            })?;
            secret.insert(key, value);
        }

        debug!(keys = secret.data.len(), "loaded secret");
        Ok(Some(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_store_reads_mounted_keys() {
        let root = tempfile::tempdir().unwrap();
        let secret_dir = root.path().join("cluster-user-auth");
        std::fs::create_dir_all(secret_dir.join("..data")).unwrap();
        std::fs::write(secret_dir.join("username"), "admin").unwrap();
        std::fs::write(secret_dir.join("password"), "$argon2id$hash").unwrap();
        std::fs::write(secret_dir.join("..data").join("ignored"), "x").unwrap();

        let store = DirectorySecretStore::new(root.path());
        let secret = store.get("cluster-user-auth").await.unwrap().unwrap();

        assert_eq!(secret.get_string("username"), "admin");
        assert_eq!(secret.get_string("password"), "$argon2id$hash");
        assert!(!secret.contains_key("..data"));
        assert!(!secret.contains_key("ignored"));
    }

    #[tokio::test]
    async fn test_directory_store_missing_secret_is_none() {
        let root = tempfile::tempdir().unwrap();
        let store = DirectorySecretStore::new(root.path());

        assert!(store.get("oidc-auth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_store_rejects_path_traversal() {
        let root = tempfile::tempdir().unwrap();
        let store = DirectorySecretStore::new(root.path());

        assert!(matches!(store.get("../etc").await, Err(Error::BadRequest { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemorySecretStore::new();
        store.insert("oidc-auth", Secret::from_iter([("issuerURL", "https://dex.example.com")]));

        let secret = store.get("oidc-auth").await.unwrap().unwrap();
        assert_eq!(secret.get_string("issuerURL"), "https://dex.example.com");
        assert_eq!(secret.get_string("clientID"), "");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_debug_hides_values() {
        let secret = Secret::from_iter([("clientSecret", "hunter2")]);
        let printed = format!("{secret:?}");
        assert!(printed.contains("clientSecret"));
        assert!(!printed.contains("hunter2"));
    }
}
