//! Directory-per-namespace, file-per-key store with lazy TTL expiry.
//!
//! Layout: `<root>/<namespace>/<key>.json`, each file an envelope
//! `{"expires_at": <unix millis>, "value": ...}`. Files are only ever
//! replaced through a temporary file in the same directory followed by an
//! atomic rename, so readers in other processes never see a partial write.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use toolgate_core::clock::{Clock, SystemClock, duration_millis};

use super::error::StoreError;

const MAX_KEY_LEN: usize = 128;

/// Logical partition of the store. Both share the approval-id key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Pending,
    Resolved,
}

impl Namespace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    expires_at: i64,
    value: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    expires_at: i64,
    value: T,
}

/// Cross-process key/value store for approvals.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ApprovalStore {
    /// Create a store rooted at `root` using the system clock.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, Arc::new(SystemClock))
    }

    /// Create a store with an explicit clock (tests, simulations).
    pub fn with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Write (or replace) `key` with an absolute deadline.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let path = self.entry_path(namespace, key)?;
        let bytes = serde_json::to_vec(&EnvelopeRef { expires_at, value })?;
        write_atomic(path, bytes, false).await?;
        debug!(
            namespace = namespace.as_str(),
            key, expires_at, "Store entry written"
        );
        Ok(())
    }

    /// Write `key` to expire `ttl` from now. Returns the deadline.
    pub async fn put_for<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let expires_at = self.now_millis().saturating_add(duration_millis(ttl));
        self.put(namespace, key, value, expires_at).await?;
        Ok(expires_at)
    }

    /// Create `key` only if no live entry exists.
    ///
    /// Returns `false` when a live entry is already present. The create is a
    /// no-clobber rename, so two processes racing on the same key cannot both
    /// succeed. An expired leftover is removed and does not block the write.
    pub async fn put_new<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        expires_at: i64,
    ) -> Result<bool, StoreError> {
        let path = self.entry_path(namespace, key)?;
        let bytes = serde_json::to_vec(&EnvelopeRef { expires_at, value })?;

        if write_atomic(path.clone(), bytes.clone(), true).await? {
            debug!(namespace = namespace.as_str(), key, "Store entry created");
            return Ok(true);
        }

        match self.read_live::<IgnoredAny>(namespace, key, &path).await {
            Ok(_) => Ok(false),
            Err(StoreError::NotFound { .. }) => write_atomic(path, bytes, true).await,
            Err(e) => Err(e),
        }
    }

    /// Read a live entry. Expired entries are deleted and reported as
    /// [`StoreError::NotFound`].
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<T, StoreError> {
        self.get_with_expiry(namespace, key)
            .await
            .map(|(value, _)| value)
    }

    /// Read a live entry together with its deadline.
    pub async fn get_with_expiry<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<(T, i64), StoreError> {
        let path = self.entry_path(namespace, key)?;
        self.read_live(namespace, key, &path).await
    }

    /// Remove `key`. Removing an absent entry is not an error.
    pub async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        let path = self.entry_path(namespace, key)?;
        remove_if_exists(&path).await?;
        debug!(namespace = namespace.as_str(), key, "Store entry deleted");
        Ok(())
    }

    /// Delete every expired entry in `namespace`. Returns how many were removed.
    pub async fn sweep_expired(&self, namespace: Namespace) -> Result<usize, StoreError> {
        let dir = self.root.join(namespace.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = self.now_millis();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<Envelope<IgnoredAny>>(&bytes) {
                Ok(envelope) if now > envelope.expires_at => {
                    remove_if_exists(&path).await?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable store entry");
                }
            }
        }

        if removed > 0 {
            debug!(
                namespace = namespace.as_str(),
                removed, "Swept expired store entries"
            );
        }
        Ok(removed)
    }

    fn entry_path(&self, namespace: Namespace, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self
            .root
            .join(namespace.as_str())
            .join(format!("{key}.json")))
    }

    async fn read_live<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
        path: &Path,
    ) -> Result<(T, i64), StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(not_found(namespace, key));
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
        if self.now_millis() > envelope.expires_at {
            remove_if_exists(path).await?;
            debug!(
                namespace = namespace.as_str(),
                key, "Store entry expired on read"
            );
            return Err(not_found(namespace, key));
        }

        Ok((envelope.value, envelope.expires_at))
    }
}

fn not_found(namespace: Namespace, key: &str) -> StoreError {
    StoreError::NotFound {
        namespace: namespace.as_str(),
        key: key.to_string(),
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Commit `bytes` to `path` via temp file + fsync + rename.
///
/// With `no_clobber` the rename refuses to replace an existing file and the
/// function returns `Ok(false)` instead.
pub(crate) async fn write_atomic(
    path: PathBuf,
    bytes: Vec<u8>,
    no_clobber: bool,
) -> Result<bool, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
        std::fs::create_dir_all(dir)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(".entry-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp_file.write_all(&bytes)?;
        temp_file.as_file_mut().sync_all()?;

        if no_clobber {
            match temp_file.persist_noclobber(&path) {
                Ok(_) => Ok(true),
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.error.into()),
            }
        } else {
            temp_file.persist(&path).map_err(|e| e.error)?;
            Ok(true)
        }
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use toolgate_core::clock::ManualClock;

    const T0: i64 = 1_700_000_000_000;

    fn store_with_clock(dir: &TempDir) -> (ApprovalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = ApprovalStore::with_clock(dir.path().join("approvals"), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with_clock(&dir);
        let value = json!({"tool": "Bash", "input": {"command": "ls"}});

        store
            .put(Namespace::Pending, "abc-1", &value, T0 + 1_000)
            .await
            .unwrap();

        let read: Value = store.get(Namespace::Pending, "abc-1").await.unwrap();
        assert_eq!(read, value);
        assert!(dir.path().join("approvals/pending/abc-1.json").exists());
    }

    #[tokio::test]
    async fn past_deadline_is_not_found_and_removed() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with_clock(&dir);

        store
            .put(Namespace::Pending, "old", &json!(1), T0 - 1)
            .await
            .unwrap();

        let err = store.get::<Value>(Namespace::Pending, "old").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!dir.path().join("approvals/pending/old.json").exists());
    }

    #[tokio::test]
    async fn entry_expires_lazily_when_clock_passes_deadline() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = store_with_clock(&dir);

        let expires_at = store
            .put_for(Namespace::Resolved, "r1", &json!("x"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(expires_at, T0 + 60_000);

        clock.advance(Duration::from_secs(59));
        assert!(store.get::<Value>(Namespace::Resolved, "r1").await.is_ok());

        clock.advance(Duration::from_secs(2));
        let err = store.get::<Value>(Namespace::Resolved, "r1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with_clock(&dir);

        store
            .put(Namespace::Pending, "k", &json!("p"), T0 + 10)
            .await
            .unwrap();
        let err = store.get::<Value>(Namespace::Resolved, "k").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_new_refuses_live_entry() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = store_with_clock(&dir);

        assert!(store
            .put_new(Namespace::Resolved, "once", &json!(1), T0 + 1_000)
            .await
            .unwrap());
        assert!(!store
            .put_new(Namespace::Resolved, "once", &json!(2), T0 + 1_000)
            .await
            .unwrap());
        let value: Value = store.get(Namespace::Resolved, "once").await.unwrap();
        assert_eq!(value, json!(1));

        clock.advance(Duration::from_secs(5));
        assert!(store
            .put_new(Namespace::Resolved, "once", &json!(3), T0 + 10_000)
            .await
            .unwrap());
        let value: Value = store.get(Namespace::Resolved, "once").await.unwrap();
        assert_eq!(value, json!(3));
    }

    #[tokio::test]
    async fn rejects_keys_that_could_escape_namespace() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with_clock(&dir);

        for key in ["", "../etc/passwd", "a/b", "dot.dot", "space key"] {
            let err = store
                .put(Namespace::Pending, key, &json!(1), T0 + 1)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with_clock(&dir);

        store
            .put(Namespace::Pending, "gone", &json!(1), T0 + 1_000)
            .await
            .unwrap();
        store.delete(Namespace::Pending, "gone").await.unwrap();
        store.delete(Namespace::Pending, "gone").await.unwrap();
        assert!(store
            .get::<Value>(Namespace::Pending, "gone")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = store_with_clock(&dir);

        store
            .put(Namespace::Pending, "short", &json!(1), T0 + 1_000)
            .await
            .unwrap();
        store
            .put(Namespace::Pending, "long", &json!(2), T0 + 60_000)
            .await
            .unwrap();

        assert_eq!(store.sweep_expired(Namespace::Resolved).await.unwrap(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep_expired(Namespace::Pending).await.unwrap(), 1);
        assert!(store.get::<Value>(Namespace::Pending, "long").await.is_ok());
    }

    #[tokio::test]
    async fn replacing_an_entry_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with_clock(&dir);

        for i in 0..5 {
            store
                .put(Namespace::Pending, "same", &json!(i), T0 + 1_000)
                .await
                .unwrap();
        }
        let files: Vec<_> = std::fs::read_dir(dir.path().join("approvals/pending"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files.len(), 1);
        let value: Value = store.get(Namespace::Pending, "same").await.unwrap();
        assert_eq!(value, json!(4));
    }
}
