//! Engine configuration.
//!
//! All tunables live on [`EngineConfig`], constructed either from the
//! environment ([`EngineConfig::from_env`], `PAGEWRIGHT_*` variables with
//! `.env` support through `dotenvy`) or programmatically via the `with_*`
//! builders. Components receive their slice of the config at wiring time;
//! nothing reads the environment after startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the ingestion and retrieval pipeline.
///
/// Defaults mirror the engine's reference deployment: 800/400 token chunks,
/// 512-text embedding batches, a 1000-document tier-1 cache, and an even
/// 6000-token budget for direct-selection answers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite connection string for durable rows and the vector collection.
    pub database_url: String,
    /// Root directory of the filesystem object store.
    pub store_root: PathBuf,
    /// Tier-1 cache capacity, in documents.
    pub cache_capacity: usize,
    /// Token window for ingestion chunking.
    pub chunk_size: usize,
    /// Token overlap between consecutive chunks.
    pub chunk_overlap: usize,
    /// Total token budget divided across direct selections.
    pub selection_token_budget: usize,
    /// Maximum texts per embedding request.
    pub embed_batch_size: usize,
    /// Per-request embedding timeout.
    pub embed_timeout: Duration,
    /// Bounded retry count for a failed embedding request.
    pub embed_max_retries: u32,
    /// Dense/sparse fusion weight; 1.0 is all-dense.
    pub fusion_alpha: f64,
    /// Default hybrid search result cap.
    pub search_limit: usize,
    /// Chat turns considered when contextualizing a follow-up.
    pub history_window: usize,
    /// Advisory lock time-to-live.
    pub lock_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            store_root: PathBuf::from("./pagewright_store"),
            cache_capacity: 1000,
            chunk_size: 800,
            chunk_overlap: 400,
            selection_token_budget: 6000,
            embed_batch_size: 512,
            embed_timeout: Duration::from_secs(5),
            embed_max_retries: 3,
            fusion_alpha: 0.5,
            search_limit: 5,
            history_window: 5,
            lock_ttl: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment, falling back to defaults.
    ///
    /// A `.env` file in the working directory is honored when present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            database_url: env::var("PAGEWRIGHT_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            store_root: env::var("PAGEWRIGHT_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_root),
            cache_capacity: parse_var("PAGEWRIGHT_CACHE_CAPACITY", defaults.cache_capacity),
            chunk_size: parse_var("PAGEWRIGHT_CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: parse_var("PAGEWRIGHT_CHUNK_OVERLAP", defaults.chunk_overlap),
            selection_token_budget: parse_var(
                "PAGEWRIGHT_SELECTION_BUDGET",
                defaults.selection_token_budget,
            ),
            embed_batch_size: parse_var("PAGEWRIGHT_EMBED_BATCH", defaults.embed_batch_size),
            embed_timeout: Duration::from_millis(parse_var(
                "PAGEWRIGHT_EMBED_TIMEOUT_MS",
                defaults.embed_timeout.as_millis() as u64,
            )),
            embed_max_retries: parse_var("PAGEWRIGHT_EMBED_RETRIES", defaults.embed_max_retries),
            fusion_alpha: parse_var("PAGEWRIGHT_FUSION_ALPHA", defaults.fusion_alpha),
            search_limit: parse_var("PAGEWRIGHT_SEARCH_LIMIT", defaults.search_limit),
            history_window: parse_var("PAGEWRIGHT_HISTORY_WINDOW", defaults.history_window),
            lock_ttl: Duration::from_secs(parse_var(
                "PAGEWRIGHT_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )),
        }
    }

    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    #[must_use]
    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = root.into();
        self
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    #[must_use]
    pub fn with_fusion_alpha(mut self, alpha: f64) -> Self {
        self.fusion_alpha = alpha;
        self
    }

    #[must_use]
    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit;
        self
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_size, 800);
        assert_eq!(cfg.chunk_overlap, 400);
        assert_eq!(cfg.embed_batch_size, 512);
        assert_eq!(cfg.search_limit, 5);
        assert!((cfg.fusion_alpha - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn builders_override_defaults() {
        let cfg = EngineConfig::default()
            .with_chunking(400, 100)
            .with_search_limit(10)
            .with_cache_capacity(8);
        assert_eq!(cfg.chunk_size, 400);
        assert_eq!(cfg.chunk_overlap, 100);
        assert_eq!(cfg.search_limit, 10);
        assert_eq!(cfg.cache_capacity, 8);
    }
}
