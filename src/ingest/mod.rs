//! Ingestion pipeline and its in-process job queue.
//!
//! A job names a user and a canonical URL. The pipeline resolves the page
//! through the document cache, writes the parsed document and a chunk
//! artifact to the object store, splits the text into token windows,
//! embeds them, and upserts the resulting points into the caller's
//! tenant. The resource record tracks progress (`processing` on entry,
//! `finish` or `failed` on exit), and a distributed mutex keyed by the
//! canonical URL keeps concurrent ingestions of the same page
//! single-flight.
//!
//! Topic classification and digest folding run after indexing succeeds;
//! they are enrichment, and their failures are logged rather than
//! propagated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::oneshot, task};
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::cache::{
    CacheError, DocumentCache, KeyError, ObjectStore, StoreError, canonicalize_url, chunk_key,
    parsed_doc_key,
};
use crate::chat::{ChatModel, prompts};
use crate::chunker::{ChunkError, TokenChunker};
use crate::digest::DigestAccumulator;
use crate::embed::{EmbedError, Embedder};
use crate::index::{ChunkPoint, IndexError, VectorIndex};
use crate::lock::{DistributedMutex, LockError};
use crate::normalize::NormalizedDocument;
use crate::storage::{ContentMeta, IndexStatus, PageMeta, ResourceRecord, ResourceRepo, StorageError};

/// How long a single-flight ingestion lease lives before another worker
/// may steal it.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

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
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),

    #[error("chunk artifact serialization failed: {0}")]
    #[diagnostic(code(pagewright::ingest::serde))]
    Serde(#[from] serde_json::Error),

    #[error("ingestion queue is closed")]
    #[diagnostic(
        code(pagewright::ingest::queue_closed),
        help("the worker was stopped; restart the service before enqueueing")
    )]
    QueueClosed,
}

/// One unit of ingestion work: index `url` into `user_id`'s tenant.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub user_id: String,
    pub url: Url,
}

impl IngestJob {
    /// Builds a job from a raw URL, canonicalizing it first so the
    /// queue, the lock key, and every derived id agree on one form.
    pub fn new(user_id: impl Into<String>, raw_url: &str) -> Result<Self, KeyError> {
        Ok(Self {
            user_id: user_id.into(),
            url: canonicalize_url(raw_url)?,
        })
    }
}

/// What `process` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The page was (re-)indexed with this many chunk points.
    Indexed { chunks: usize },
    /// Another worker holds the lease for this URL; nothing was done.
    Skipped,
}

/// Coarse availability answer for the status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Unavailable,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unavailable => "unavailable",
        }
    }
}

/// One entry of the chunk artifact stored beside the parsed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub ordinal: usize,
    pub content: String,
}

/// The ingestion pipeline proper. Owns every collaborator a job needs;
/// construct once at wiring time and share behind an [`Arc`].
pub struct IngestPipeline {
    resources: ResourceRepo,
    store: Arc<dyn ObjectStore>,
    cache: Arc<DocumentCache>,
    chunker: TokenChunker,
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    mutex: Arc<dyn DistributedMutex>,
    model: Arc<dyn ChatModel>,
    digests: Arc<DigestAccumulator>,
    lock_ttl: Duration,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resources: ResourceRepo,
        store: Arc<dyn ObjectStore>,
        cache: Arc<DocumentCache>,
        chunker: TokenChunker,
        embedder: Arc<Embedder>,
        index: Arc<dyn VectorIndex>,
        mutex: Arc<dyn DistributedMutex>,
        model: Arc<dyn ChatModel>,
        digests: Arc<DigestAccumulator>,
    ) -> Self {
        Self {
            resources,
            store,
            cache,
            chunker,
            embedder,
            index,
            mutex,
            model,
            digests,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Runs one job under the single-flight lease. Returns `Skipped`
    /// when another worker already holds the lease for this URL.
    #[instrument(skip(self, job), fields(url = %job.url, user = %job.user_id))]
    pub async fn process(&self, job: &IngestJob) -> Result<IngestOutcome, IngestError> {
        let lock_key = format!("ingest:{}", job.url);
        let Some(lease) = self.mutex.acquire(&lock_key, self.lock_ttl).await? else {
            info!(url = %job.url, "ingestion already in flight, skipping");
            return Ok(IngestOutcome::Skipped);
        };
        let result = self.run(job).await;
        match self.mutex.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %lock_key, "ingestion lease expired before release"),
            Err(err) => warn!(key = %lock_key, error = %err, "ingestion lease release failed"),
        }
        result
    }

    async fn run(&self, job: &IngestJob) -> Result<IngestOutcome, IngestError> {
        let doc = match self.cache.get_or_fetch(&job.url).await {
            Ok(doc) => doc,
            Err(err) => {
                // A page we cannot fetch still gets a resource row, so
                // the failure is visible to status queries.
                self.resources.upsert(&job.url, &PageMeta::default()).await?;
                self.mark_failed(&job.url).await;
                return Err(err.into());
            }
        };

        let page_meta = PageMeta {
            title: Some(doc.title.clone()),
            published_time: doc.published_time.clone(),
        };
        let record = self.resources.upsert(&job.url, &page_meta).await?;

        match self.index_document(job, &record, &doc).await {
            Ok(chunks) => {
                self.resources
                    .set_status(&job.url, IndexStatus::Finished)
                    .await?;
                self.enrich(job, &record, &doc).await;
                Ok(IngestOutcome::Indexed { chunks })
            }
            Err(err) => {
                self.mark_failed(&job.url).await;
                Err(err)
            }
        }
    }

    /// Artifacts, chunking, embedding, and the index upsert. Artifacts
    /// land before embedding so a later embedding failure leaves the
    /// parsed document readable from tier 2.
    async fn index_document(
        &self,
        job: &IngestJob,
        record: &ResourceRecord,
        doc: &NormalizedDocument,
    ) -> Result<usize, IngestError> {
        self.store.put(&record.storage_key, &doc.text).await?;

        let chunks = self.chunker.chunk(&doc.text)?;
        let artifact: Vec<ChunkRecord> = chunks
            .iter()
            .enumerate()
            .map(|(ordinal, content)| ChunkRecord {
                ordinal,
                content: content.clone(),
            })
            .collect();
        self.store
            .put(&record.chunk_storage_key, &serde_json::to_string(&artifact)?)
            .await?;

        if chunks.is_empty() {
            info!(url = %job.url, "document produced no chunks");
            return Ok(0);
        }

        let vectors = self.embedder.embed(&chunks).await?;
        let points: Vec<ChunkPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(content, vector)| ChunkPoint::weblink(job.url.as_str(), &doc.title, content, vector))
            .collect();
        self.index
            .upsert_chunks(&job.user_id, &job.url, &points)
            .await?;
        Ok(points.len())
    }

    async fn mark_failed(&self, url: &Url) {
        if let Err(err) = self.resources.set_status(url, IndexStatus::Failed).await {
            warn!(url = %url, error = %err, "could not record failed status");
        }
    }

    /// Topic classification plus the daily-digest fold. Best effort.
    async fn enrich(&self, job: &IngestJob, record: &ResourceRecord, doc: &NormalizedDocument) {
        let meta = self.extract_content_meta(doc).await;
        if meta.topics.is_empty() {
            return;
        }
        if let Err(err) = self.resources.set_content_meta(&job.url, &meta).await {
            warn!(url = %job.url, error = %err, "could not persist content meta");
            return;
        }
        let today = Utc::now().date_naive();
        let resource_id = record.id.to_string();
        if let Err(err) = self
            .digests
            .record_topics(&job.user_id, today, &meta.topics, &resource_id, doc)
            .await
        {
            warn!(url = %job.url, error = %err, "digest update failed");
        }
    }

    async fn extract_content_meta(&self, doc: &NormalizedDocument) -> ContentMeta {
        let body = prompts::excerpt(&doc.text, prompts::PROMPT_EXCERPT_CHARS);
        let prompt = prompts::topic_extraction(&doc.title, body);
        match self.model.complete(&prompt).await {
            Ok(raw) => parse_content_meta(&raw),
            Err(err) => {
                warn!(error = %err, "topic extraction failed");
                ContentMeta::default()
            }
        }
    }

    /// Whether the stored artifacts for `raw_url` are readable. Internal
    /// failures collapse to `Unavailable`; callers never see raw errors.
    pub async fn status(&self, raw_url: &str) -> ProbeStatus {
        let Ok(url) = canonicalize_url(raw_url) else {
            return ProbeStatus::Unavailable;
        };
        let doc = self
            .store
            .exists(&parsed_doc_key(&url))
            .await
            .unwrap_or(false);
        let chunks = self.store.exists(&chunk_key(&url)).await.unwrap_or(false);
        if doc && chunks {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Unavailable
        }
    }
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

fn parse_content_meta(raw: &str) -> ContentMeta {
    let Some(value) = crate::chat::parse::loose_json(raw) else {
        return ContentMeta::default();
    };
    match serde_json::from_value::<ContentMeta>(value) {
        Ok(mut meta) => {
            meta.topics.truncate(3);
            meta
        }
        Err(_) => ContentMeta::default(),
    }
}

/// Background worker that drains the ingestion queue one job at a time.
pub struct IngestService {
    pipeline: Arc<IngestPipeline>,
    job_channel: (flume::Sender<IngestJob>, flume::Receiver<IngestJob>),
    worker: Mutex<Option<WorkerState>>,
}

struct WorkerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl IngestService {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self {
            pipeline,
            job_channel: flume::unbounded(),
            worker: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// Queues `job` for the background worker.
    pub fn enqueue(&self, job: IngestJob) -> Result<(), IngestError> {
        self.job_channel
            .0
            .send(job)
            .map_err(|_| IngestError::QueueClosed)
    }

    /// Spawns the background worker. Idempotent: calling again while a
    /// worker is running has no effect.
    pub fn start(&self) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }

        let receiver = self.job_channel.1.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(job) => match pipeline.process(&job).await {
                            Ok(IngestOutcome::Indexed { chunks }) => {
                                info!(url = %job.url, chunks, "ingestion finished");
                            }
                            Ok(IngestOutcome::Skipped) => {}
                            Err(err) => {
                                error!(url = %job.url, error = %err, "ingestion failed");
                            }
                        }
                    }
                }
            }
        });

        *guard = Some(WorkerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stops the worker after the job in hand finishes. Jobs still in
    /// the queue stay queued for the next `start`.
    pub async fn stop(&self) {
        let state = self.worker.lock().take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for IngestService {
    fn drop(&mut self) {
        if let Some(state) = self.worker.lock().take() {
            let _ = state.shutdown_tx.send(());
            state.handle.abort();
        }
    }
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("queued", &self.job_channel.1.len())
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}
