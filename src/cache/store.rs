//! Durable object store behind the tier-2 cache and the status probe.

use std::path::PathBuf;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("object store I/O failure on {key}: {message}")]
    #[diagnostic(code(pagewright::store::io))]
    Io { key: String, message: String },
}

impl StoreError {
    fn io(key: &str, err: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Minimal keyed blob store. Keys are slash-separated logical paths
/// (`docs/…`, `chunks/…`); implementations own the physical mapping.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, body: &str) -> Result<(), StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Filesystem-backed store. Key segments are sanitized into deterministic
/// file names so the same key always lands on the same path.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(sanitize_component(segment));
        }
        path
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }

    async fn put(&self, key: &str, body: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::io(key, err))?;
        }
        fs::write(&path, body)
            .await
            .map_err(|err| StoreError::io(key, err))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.path_for(key))
            .await
            .map_err(|err| StoreError::io(key, err))?)
    }
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_exists_round_trip() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert!(!store.exists("docs/a.md").await.unwrap());
        assert_eq!(store.get("docs/a.md").await.unwrap(), None);

        store.put("docs/a.md", "# hello").await.unwrap();
        assert!(store.exists("docs/a.md").await.unwrap());
        assert_eq!(
            store.get("docs/a.md").await.unwrap().as_deref(),
            Some("# hello")
        );
    }

    #[tokio::test]
    async fn keys_with_odd_characters_are_sanitized() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("docs/a b?c.md", "body").await.unwrap();
        assert_eq!(
            store.get("docs/a b?c.md").await.unwrap().as_deref(),
            Some("body")
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_body() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("k", "one").await.unwrap();
        store.put("k", "two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
    }
}
