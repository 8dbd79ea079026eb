use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::app::ports::ObjectStore;
use crate::common::error::StoreError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Object store over a local directory. Writes are staged to a hidden temp
/// file beside the target, synced, then renamed into place.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.contains('\\')
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn not_found(key: &str, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(e)
    }
}

fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            walk(&path, root, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| not_found(key, e))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(StoreError::InvalidKey(key.to_string()));
        };
        tokio::fs::create_dir_all(dir).await?;

        let staged = dir.join(format!(
            ".{}.{}-{}.tmp",
            name.to_string_lossy(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = async {
            let mut file = tokio::fs::File::create(&staged).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&staged, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(StoreError::Io(e));
        }
        debug!(key, bytes = bytes.len(), "Object committed");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&root, &root, &mut out).map(|_| out)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(ErrorKind::Other, e)))??;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_round_trip_and_no_temp_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("curated/orders/a.json", b"{}").await.unwrap();
        store.put("curated/orders/a.json", b"{\"v\":2}").await.unwrap();

        assert_eq!(store.get("curated/orders/a.json").await.unwrap(), b"{\"v\":2}");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("curated/orders"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json"]);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(store.get("nope.json").await, Err(StoreError::NotFound(_))));
        assert!(!store.exists("nope.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_prefix_sorted() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["curated/orders/b.json", "curated/orders/a.json", "curated/payments/c.json"] {
            store.put(key, b"x").await.unwrap();
        }
        assert_eq!(
            store.list("curated/orders/").await.unwrap(),
            vec!["curated/orders/a.json", "curated/orders/b.json"]
        );
        assert!(store.list("prod/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["../evil", "/etc/passwd", "", "a/../../b"] {
            assert!(matches!(store.put(key, b"x").await, Err(StoreError::InvalidKey(_))), "{key}");
        }
    }
}
