//! Recall strategy per chat turn.
//!
//! Two modes, one output shape. When the request carries explicit
//! per-source text selections, search is skipped entirely and the
//! selections come back as the retrieved set, truncated to an even
//! per-source share of the token budget. Otherwise the (possibly
//! rewritten) query is embedded and run through tenant-scoped hybrid
//! search, optionally restricted to the filter's URL allow-list.

use std::sync::Arc;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::cache::keys::canonicalize_url;
use crate::cache::{CacheError, DocumentCache};
use crate::chunker::{ChunkError, TokenChunker};
use crate::embed::{EmbedError, Embedder};
use crate::index::{IndexError, SearchFilter, VectorIndex};

/// Default total token budget shared across selected sources.
pub const DEFAULT_SELECTION_BUDGET: usize = 6000;

#[derive(Debug, Error, Diagnostic)]
pub enum RetrievalError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),
}

/// One source entry in a chat request's filter. URL-only entries scope
/// similarity search; entries carrying `selected_text` switch the turn
/// into selection mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceSelection {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
}

/// The active source scope for a turn, persisted with the human message
/// so follow-ups can reuse it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceFilter {
    pub selections: Vec<SourceSelection>,
}

impl SourceFilter {
    pub fn for_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selections: urls
                .into_iter()
                .map(|url| SourceSelection {
                    url: url.into(),
                    ..SourceSelection::default()
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    /// Selection mode applies when any entry carries explicit text.
    pub fn has_selections(&self) -> bool {
        self.selections
            .iter()
            .any(|s| s.selected_text.as_deref().is_some_and(|t| !t.trim().is_empty()))
    }

    fn allow_list(&self) -> Option<SearchFilter> {
        if self.is_empty() {
            None
        } else {
            Some(SearchFilter::for_urls(
                self.selections.iter().map(|s| s.url.clone()),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetadata {
    pub title: String,
    pub url: String,
}

/// Uniform retrieval output consumed by the generator, regardless of
/// which mode produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedSource {
    pub text: String,
    pub metadata: SourceMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

pub struct RetrievalOrchestrator {
    cache: Arc<DocumentCache>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<Embedder>,
    splitter: TokenChunker,
    token_budget: usize,
    limit: usize,
}

impl RetrievalOrchestrator {
    pub fn new(
        cache: Arc<DocumentCache>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<Embedder>,
        splitter: TokenChunker,
    ) -> Self {
        Self {
            cache,
            index,
            embedder,
            splitter,
            token_budget: DEFAULT_SELECTION_BUDGET,
            limit: crate::index::DEFAULT_SEARCH_LIMIT,
        }
    }

    #[must_use]
    pub fn with_token_budget(mut self, token_budget: usize) -> Self {
        self.token_budget = token_budget.max(1);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Retrieves grounding sources for one turn. `query` is the raw or
    /// contextualized question depending on what the caller did with the
    /// chat history.
    pub async fn retrieve(
        &self,
        tenant: &str,
        query: &str,
        filter: Option<&SourceFilter>,
    ) -> Result<Vec<RetrievedSource>, RetrievalError> {
        match filter {
            Some(filter) if filter.has_selections() => self.from_selections(filter).await,
            _ => self.from_similarity(tenant, query, filter).await,
        }
    }

    /// Selection mode: no search. Each distinct source gets an even share
    /// of the token budget and is truncated to it.
    async fn from_selections(
        &self,
        filter: &SourceFilter,
    ) -> Result<Vec<RetrievedSource>, RetrievalError> {
        let mut distinct: Vec<&SourceSelection> = Vec::new();
        for selection in &filter.selections {
            if !distinct.iter().any(|s| s.url == selection.url) {
                distinct.push(selection);
            }
        }
        let share = (self.token_budget / distinct.len().max(1)).max(1);
        let truncator = self.splitter.with_window(share, 0)?;

        let mut sources = Vec::with_capacity(distinct.len());
        for selection in distinct {
            let Some((text, fallback_title)) = self.selection_text(selection).await else {
                continue;
            };
            let text = truncate_to_budget(&truncator, &text)?;
            let title = selection
                .title
                .clone()
                .or(fallback_title)
                .unwrap_or_else(|| selection.url.clone());
            sources.push(RetrievedSource {
                text,
                metadata: SourceMetadata {
                    title,
                    url: selection.url.clone(),
                },
                score: None,
            });
        }
        Ok(sources)
    }

    /// Explicit text wins; URL-only entries fall back to the cached
    /// document. Sources that cannot be resolved are skipped, not fatal.
    async fn selection_text(&self, selection: &SourceSelection) -> Option<(String, Option<String>)> {
        if let Some(text) = selection
            .selected_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        {
            return Some((text.to_string(), None));
        }
        let url = match canonicalize_url(&selection.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %selection.url, error = %e, "skipping malformed selection URL");
                return None;
            }
        };
        match self.cache.get_or_fetch(&url).await {
            Ok(doc) => Some((doc.text, Some(doc.title))),
            Err(e) => {
                warn!(url = %selection.url, error = %e, "skipping unresolvable selection");
                None
            }
        }
    }

    async fn from_similarity(
        &self,
        tenant: &str,
        query: &str,
        filter: Option<&SourceFilter>,
    ) -> Result<Vec<RetrievedSource>, RetrievalError> {
        let vector = self.embedder.embed_query(query).await?;
        let allow_list = filter.and_then(SourceFilter::allow_list);
        let hits = self
            .index
            .hybrid_search(tenant, query, Some(&vector), allow_list.as_ref(), self.limit)
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedSource {
                text: hit.content,
                metadata: SourceMetadata {
                    title: hit.title,
                    url: hit.url,
                },
                score: Some(hit.additional.score),
            })
            .collect())
    }
}

/// First token window of `text`, or the text unchanged when it already
/// fits the window.
fn truncate_to_budget(truncator: &TokenChunker, text: &str) -> Result<String, ChunkError> {
    if truncator.count_tokens(text) <= truncator.chunk_size() {
        return Ok(text.to_string());
    }
    let mut chunks = truncator.chunk(text)?;
    Ok(chunks.drain(..).next().unwrap_or_default())
}
