//! # Pagewright: Web-content Ingestion and Retrieval-augmented Chat
//!
//! Pagewright turns saved web pages into a tenant-scoped, citation-grounded
//! chat corpus: pages are fetched, normalized to clean text, chunked into
//! token windows, embedded, and indexed for hybrid (dense + keyword)
//! search; a streaming chat layer answers questions grounded in the
//! retrieved chunks and keeps per-day topic digests per user.
//!
//! ## Core Concepts
//!
//! - **Ingestion**: A background worker drains a job queue; each job
//!   fetches one URL, stores the parsed document and its chunk artifact,
//!   and upserts embedded chunk points into the caller's tenant.
//! - **Cache**: Three tiers resolve a URL to a normalized document
//!   without re-fetching: an in-process LRU, the durable object store,
//!   then a live fetch.
//! - **Hybrid search**: Dense cosine scores and keyword match scores are
//!   min-max normalized and fused with a configurable weight; every hit
//!   carries its score breakdown.
//! - **Chat**: One turn streams a typed event sequence of sources, answer
//!   tokens, related questions, then a terminal end event. Citations are
//!   normalized to a canonical `[citation:N]` form before persistence.
//! - **Digests**: Each ingested page is classified into topics; per-day,
//!   per-topic summaries accumulate alongside user topic preferences.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pagewright::chat::{ChatEvent, ChatRequest};
//! use pagewright::config::EngineConfig;
//! use pagewright::engine::Engine;
//! # async fn run(
//! #     fetcher: Arc<dyn pagewright::fetch::Fetcher>,
//! #     embedding: Arc<dyn pagewright::embed::EmbeddingProvider>,
//! #     model: Arc<dyn pagewright::chat::ChatModel>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::connect(EngineConfig::from_env(), fetcher, embedding, model).await?;
//! engine.enqueue_ingestion("user-1", "https://example.com/article")?;
//!
//! let turn = engine
//!     .chat(ChatRequest::new("user-1", "what does the article say?"))
//!     .await?;
//! let mut events = turn.events;
//! while let Some(event) = events.next().await {
//!     match event {
//!         ChatEvent::Token { text } => print!("{text}"),
//!         ChatEvent::End { error: Some(err) } => eprintln!("turn failed: {err}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### The Event Contract
//!
//! Every chat turn emits `Sources`, then zero or more `Token`s, then
//! `RelatedQuestions`, then exactly one terminal `End`. Events serialize
//! with a `type` tag, so transports stay self-describing:
//!
//! ```
//! use pagewright::chat::ChatEvent;
//!
//! let event = ChatEvent::token("Hello");
//! let wire = serde_json::to_string(&event).unwrap();
//! assert_eq!(wire, r#"{"type":"token","text":"Hello"}"#);
//! ```
//!
//! ## Module Guide
//!
//! - [`engine`] - Facade wiring every layer from one [`config::EngineConfig`]
//! - [`ingest`] - Job queue, worker, pipeline, and the status probe
//! - [`fetch`] - Page-fetching boundary (HTTP behind the `http-fetch` feature)
//! - [`normalize`] - HTML-to-text conversion strategies and tidying
//! - [`cache`] - Canonical keys, object store, and the tiered document cache
//! - [`chunker`] - Token-window splitting over the `cl100k_base` vocabulary
//! - [`embed`] - Batching, retrying embedding front end
//! - [`index`] - Tenant-scoped vector collection and hybrid search
//! - [`retrieval`] - Selection- and similarity-driven source gathering
//! - [`chat`] - Conversational turns, event stream, prompts, citations
//! - [`digest`] - Per-day topic summaries and preference accumulation
//! - [`storage`] - SQLite repositories for resources, sessions, digests
//! - [`lock`] - Advisory locks for single-flight ingestion
//! - [`providers`] - Model-provider adapters (rig-core behind the `rig` feature)

pub mod cache;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod digest;
pub mod embed;
pub mod engine;
pub mod fetch;
pub mod index;
pub mod ingest;
pub mod lock;
pub mod normalize;
pub mod providers;
pub mod retrieval;
pub mod storage;
pub mod telemetry;
