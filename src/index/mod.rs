//! Tenant-partitioned hybrid vector index.
//!
//! One collection per deployment; every point carries its tenant and a
//! deterministic id derived from `(url, ordinal)`, so re-ingestion
//! overwrites instead of duplicating. Retrieval fuses dense cosine
//! similarity with sparse keyword matching (see [`fusion`]); tenant
//! isolation is enforced in every query.
//!
//! The [`VectorIndex`] trait is the product-neutral contract; this crate
//! ships [`SqliteVectorIndex`] on the shared sqlx pool.

pub mod fusion;
mod sqlite;

pub use sqlite::SqliteVectorIndex;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Point kind recorded for web-page chunks.
pub const WEBLINK_KIND: &str = "weblink";

/// Default result cap for hybrid search.
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    #[error("vector index query failed: {0}")]
    #[diagnostic(
        code(pagewright::index::sqlx),
        help("Check that migrations ran and the database is reachable.")
    )]
    Sqlx(#[from] sqlx::Error),
}

/// Outcome of [`VectorIndex::ensure_tenant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    Created,
    Existing,
}

/// One indexed chunk, in the collection's wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPoint {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    pub vector: Vec<f32>,
}

impl ChunkPoint {
    pub fn weblink(
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            url: url.into(),
            kind: WEBLINK_KIND.to_string(),
            title: title.into(),
            content: content.into(),
            vector,
        }
    }
}

/// Relevance diagnostics attached to every hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Additional {
    pub score: f64,
    #[serde(rename = "explainScore")]
    pub explain_score: String,
}

/// Hybrid query response row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "_additional")]
    pub additional: Additional,
}

/// Optional restriction of a query to an allow-list of source URLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilter {
    pub urls: Vec<String>,
}

impl SearchFilter {
    pub fn for_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Contract every vector-index backend must honor.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent create-if-absent; existing tenants are reported, not
    /// treated as errors.
    async fn ensure_tenant(&self, tenant: &str) -> Result<TenantState, IndexError>;

    /// Writes the full ordered chunk set for one resource. Point ids are
    /// derived from `(url, ordinal)`; writing the same resource again
    /// overwrites in place.
    async fn upsert_chunks(
        &self,
        tenant: &str,
        url: &Url,
        points: &[ChunkPoint],
    ) -> Result<(), IndexError>;

    /// Dense+sparse fused retrieval, scoped to `tenant`, optionally
    /// restricted to `filter`'s URL allow-list. Returns at most `limit`
    /// hits, best first.
    async fn hybrid_search(
        &self,
        tenant: &str,
        query: &str,
        vector: Option<&[f32]>,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    /// Number of points stored for `tenant`.
    async fn count(&self, tenant: &str) -> Result<u64, IndexError>;
}
