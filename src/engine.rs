//! Top-level facade wiring every component together.
//!
//! [`Engine::connect`] opens the database, builds the cache, chunker,
//! embedder, index, retrieval, chat, and digest layers from one
//! [`EngineConfig`], and starts the background ingestion worker. The
//! three external collaborators (page fetcher, embedding provider, chat
//! model) are injected as trait objects; everything else is owned here.

use std::sync::Arc;

use chrono::NaiveDate;
use miette::Diagnostic;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;
use url::Url;

use crate::cache::{DocumentCache, FsObjectStore, KeyError, ObjectStore, canonicalize_url};
use crate::chat::{ChatError, ChatModel, ChatRequest, ConversationalGenerator, TurnHandle};
use crate::chunker::{ChunkError, TokenChunker};
use crate::config::EngineConfig;
use crate::digest::{DigestAccumulator, ModelSummarizer};
use crate::embed::{Embedder, EmbeddingProvider};
use crate::fetch::Fetcher;
use crate::index::{SearchHit, SqliteVectorIndex, VectorIndex};
use crate::ingest::{IngestError, IngestJob, IngestOutcome, IngestPipeline, IngestService, ProbeStatus};
use crate::lock::{DistributedMutex, SqliteMutex};
use crate::retrieval::RetrievalOrchestrator;
use crate::storage::{
    self, DigestRecord, DigestRepo, ResourceRecord, ResourceRepo, SessionRepo, StorageError,
    TopicPreference,
};

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] crate::index::IndexError),
}

/// One running engine instance.
pub struct Engine {
    config: EngineConfig,
    pool: SqlitePool,
    resources: ResourceRepo,
    digest_repo: DigestRepo,
    index: Arc<dyn VectorIndex>,
    generator: ConversationalGenerator,
    ingest: IngestService,
}

impl Engine {
    /// Opens the database, wires every layer, and starts the ingestion
    /// worker.
    #[instrument(skip_all, fields(database_url = %config.database_url))]
    pub async fn connect(
        config: EngineConfig,
        fetcher: Arc<dyn Fetcher>,
        embedding: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ChatModel>,
    ) -> Result<Self, EngineError> {
        let pool = storage::connect(&config.database_url).await?;

        let resources = ResourceRepo::new(pool.clone());
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.store_root));
        let cache = Arc::new(DocumentCache::new(
            config.cache_capacity,
            Arc::clone(&store),
            Arc::new(resources.clone()),
            fetcher,
        ));
        let chunker = TokenChunker::new(config.chunk_size, config.chunk_overlap)?;
        let embedder = Arc::new(
            Embedder::new(embedding)
                .with_batch_size(config.embed_batch_size)
                .with_timeout(config.embed_timeout)
                .with_max_retries(config.embed_max_retries),
        );
        let index: Arc<dyn VectorIndex> =
            Arc::new(SqliteVectorIndex::new(pool.clone(), config.fusion_alpha));

        let retrieval = Arc::new(
            RetrievalOrchestrator::new(
                Arc::clone(&cache),
                Arc::clone(&index),
                Arc::clone(&embedder),
                chunker.clone(),
            )
            .with_token_budget(config.selection_token_budget)
            .with_limit(config.search_limit),
        );

        let sessions = SessionRepo::new(pool.clone());
        let generator =
            ConversationalGenerator::new(sessions, retrieval, Arc::clone(&model))
                .with_history_window(config.history_window);

        let digest_repo = DigestRepo::new(pool.clone());
        let digests = Arc::new(DigestAccumulator::new(
            digest_repo.clone(),
            Arc::new(ModelSummarizer::new(Arc::clone(&model))),
        ));

        let mutex: Arc<dyn DistributedMutex> = Arc::new(SqliteMutex::new(pool.clone()));
        let pipeline = Arc::new(
            IngestPipeline::new(
                resources.clone(),
                store,
                cache,
                chunker,
                embedder,
                Arc::clone(&index),
                mutex,
                model,
                digests,
            )
            .with_lock_ttl(config.lock_ttl),
        );
        let ingest = IngestService::new(pipeline);
        ingest.start();

        Ok(Self {
            config,
            pool,
            resources,
            digest_repo,
            index,
            generator,
            ingest,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connection pool backing every repository. Exposed for embedders
    /// that run their own queries against the same database.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Queues a page for background ingestion into `user_id`'s tenant.
    pub fn enqueue_ingestion(&self, user_id: &str, raw_url: &str) -> Result<(), EngineError> {
        let job = IngestJob::new(user_id, raw_url)?;
        self.ingest.enqueue(job)?;
        Ok(())
    }

    /// Runs one ingestion inline instead of through the queue.
    pub async fn ingest_now(
        &self,
        user_id: &str,
        raw_url: &str,
    ) -> Result<IngestOutcome, EngineError> {
        let job = IngestJob::new(user_id, raw_url)?;
        Ok(self.ingest.pipeline().process(&job).await?)
    }

    /// Availability of the stored artifacts for `raw_url`.
    pub async fn resource_status(&self, raw_url: &str) -> ProbeStatus {
        self.ingest.pipeline().status(raw_url).await
    }

    /// Resource record for `raw_url`, if it was ever ingested.
    pub async fn resource(&self, raw_url: &str) -> Result<Option<ResourceRecord>, EngineError> {
        let url: Url = canonicalize_url(raw_url)?;
        Ok(self.resources.get(&url).await?)
    }

    /// Starts one chat turn; events arrive on the returned handle.
    pub async fn chat(&self, request: ChatRequest) -> Result<TurnHandle, EngineError> {
        Ok(self.generator.chat_turn(request).await?)
    }

    /// Direct hybrid search against `user_id`'s tenant, without the chat
    /// layer on top.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        vector: Option<&[f32]>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        Ok(self
            .index
            .hybrid_search(user_id, query, vector, None, limit)
            .await?)
    }

    /// The digest bucket for one (user, day, topic), if any.
    pub async fn digest(
        &self,
        user_id: &str,
        date: NaiveDate,
        topic_key: &str,
    ) -> Result<Option<DigestRecord>, EngineError> {
        Ok(self.digest_repo.get(user_id, date, topic_key).await?)
    }

    /// Accumulated topic preferences for `user_id`, strongest first.
    pub async fn topic_preferences(
        &self,
        user_id: &str,
    ) -> Result<Vec<TopicPreference>, EngineError> {
        Ok(self.digest_repo.preferences(user_id).await?)
    }

    /// Stops the ingestion worker after the job in hand finishes.
    pub async fn shutdown(&self) {
        self.ingest.stop().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish()
    }
}
