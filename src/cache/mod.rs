//! Multi-tier document cache.
//!
//! `get_or_fetch` resolves a canonical URL through three tiers:
//!
//! ```text
//! tier 1: in-process LRU ──▶ tier 2: durable object store ──▶ tier 3: live fetch
//!          (no I/O)            (parsed doc + resource meta)      (fetch + normalize)
//! ```
//!
//! A hit at any tier never invokes the fetcher. Tier-2 hits and tier-3
//! fetches populate tier 1; tier 2 is only written by ingestion, when the
//! resource record is created. There is no cross-tier invalidation;
//! tier-1 entries leave by LRU eviction alone.
//!
//! The cache is an explicit object with a stated capacity, constructed at
//! wiring time and handed to the retrieval service; nothing here is
//! process-global.

pub mod keys;
pub mod store;

pub use keys::{
    KeyError, PARSER_VERSION, canonicalize_url, chunk_key, chunk_point_id, parsed_doc_key,
    resource_id,
};
pub use store::{FsObjectStore, ObjectStore, StoreError};

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::fetch::{FetchError, Fetcher};
use crate::normalize::{NormalizedDocument, Normalizer};

#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] FetchError),
}

/// Metadata recovered from the resource record on a tier-2 hit.
#[derive(Debug, Clone, Default)]
pub struct DocumentMeta {
    pub title: String,
    pub published_time: Option<String>,
}

/// Supplies resource-record metadata for tier-2 hits. The storage layer
/// implements this; tests can use [`NoMeta`].
#[async_trait]
pub trait ResourceMetaSource: Send + Sync {
    async fn page_meta(&self, url: &Url) -> Option<DocumentMeta>;
}

/// Meta source that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMeta;

#[async_trait]
impl ResourceMetaSource for NoMeta {
    async fn page_meta(&self, _url: &Url) -> Option<DocumentMeta> {
        None
    }
}

pub struct DocumentCache {
    tier1: Mutex<LruCache<String, NormalizedDocument>>,
    store: Arc<dyn ObjectStore>,
    meta: Arc<dyn ResourceMetaSource>,
    fetcher: Arc<dyn Fetcher>,
    normalizer: Normalizer,
}

impl DocumentCache {
    pub fn new(
        capacity: usize,
        store: Arc<dyn ObjectStore>,
        meta: Arc<dyn ResourceMetaSource>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            tier1: Mutex::new(LruCache::new(capacity)),
            store,
            meta,
            fetcher,
            normalizer: Normalizer::new(),
        }
    }

    /// Resolves `url` through the tiers; see the module docs for the
    /// population rules.
    pub async fn get_or_fetch(&self, url: &Url) -> Result<NormalizedDocument, CacheError> {
        let cache_key = url.as_str().to_string();
        if let Some(doc) = self.tier1.lock().get(&cache_key) {
            debug!(url = %url, "document cache hit (memory)");
            return Ok(doc.clone());
        }

        if let Some(text) = self.store.get(&parsed_doc_key(url)).await? {
            debug!(url = %url, "document cache hit (object store)");
            let meta = self.meta.page_meta(url).await.unwrap_or_default();
            let doc = NormalizedDocument {
                title: if meta.title.is_empty() {
                    url.to_string()
                } else {
                    meta.title
                },
                text,
                published_time: meta.published_time,
                source_url: cache_key.clone(),
            };
            self.tier1.lock().put(cache_key, doc.clone());
            return Ok(doc);
        }

        debug!(url = %url, "document cache miss, fetching live");
        let snapshot = self.fetcher.fetch(url).await?;
        let doc = self.normalizer.normalize(&snapshot);
        self.tier1.lock().put(cache_key, doc.clone());
        Ok(doc)
    }

    /// Documents currently held in tier 1.
    pub fn memory_len(&self) -> usize {
        self.tier1.lock().len()
    }
}

impl std::fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCache")
            .field("tier1_len", &self.memory_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::PageSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, url: &Url) -> Result<PageSnapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PageSnapshot::new(url.to_string())
                .with_html("<body><p>fetched body</p></body>")
                .with_title("Fetched"))
        }
    }

    fn cache_with(
        capacity: usize,
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<CountingFetcher>,
    ) -> DocumentCache {
        DocumentCache::new(capacity, store, Arc::new(NoMeta), fetcher)
    }

    #[tokio::test]
    async fn second_read_hits_memory_and_skips_fetcher() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache_with(4, store, Arc::clone(&fetcher));
        let url = canonicalize_url("https://example.com/page").unwrap();

        let first = cache.get_or_fetch(&url).await.unwrap();
        assert!(first.text.contains("fetched body"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let second = cache.get_or_fetch(&url).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn object_store_hit_never_fetches_and_warms_memory() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let fetcher = Arc::new(CountingFetcher::new());
        let url = canonicalize_url("https://example.com/stored").unwrap();
        store
            .put(&parsed_doc_key(&url), "durable text")
            .await
            .unwrap();

        let cache = cache_with(4, Arc::clone(&store) as Arc<dyn ObjectStore>, Arc::clone(&fetcher));
        let doc = cache.get_or_fetch(&url).await.unwrap();
        assert_eq!(doc.text, "durable text");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.memory_len(), 1);
    }

    #[tokio::test]
    async fn eviction_is_by_lru_only() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache_with(2, store, Arc::clone(&fetcher));

        for n in 0..3 {
            let url = canonicalize_url(&format!("https://example.com/{n}")).unwrap();
            cache.get_or_fetch(&url).await.unwrap();
        }
        assert_eq!(cache.memory_len(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        // /0 was evicted; re-reading it fetches again.
        let url0 = canonicalize_url("https://example.com/0").unwrap();
        cache.get_or_fetch(&url0).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }
}
