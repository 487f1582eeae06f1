//! Shared harness: a fully wired engine backed by deterministic
//! in-process collaborators, plus an HTML article generator.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pagewright::chat::{ChatModel, ScriptedChatModel};
use pagewright::config::EngineConfig;
use pagewright::embed::{EmbeddingProvider, MockEmbeddingProvider};
use pagewright::engine::Engine;
use pagewright::fetch::{FetchError, Fetcher};
use pagewright::normalize::PageSnapshot;
use tempfile::TempDir;
use url::Url;

/// Serves one fixed page for every URL and counts how often it is asked.
pub struct CountingFetcher {
    title: String,
    html: String,
    calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn new(title: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            html: html.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, url: &Url) -> Result<PageSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PageSnapshot::new(url.to_string())
            .with_html(self.html.clone())
            .with_title(self.title.clone()))
    }
}

/// An engine plus handles to the collaborators the tests script and probe.
pub struct TestEngine {
    pub engine: Engine,
    pub fetcher: Arc<CountingFetcher>,
    pub provider: Arc<MockEmbeddingProvider>,
    pub model: Arc<ScriptedChatModel>,
    _store_dir: TempDir,
}

/// Connects an in-memory engine whose fetcher answers every URL with
/// `html` under the title "Saved Page".
pub async fn engine_with(html: &str) -> TestEngine {
    let fetcher = Arc::new(CountingFetcher::new("Saved Page", html));
    let provider = Arc::new(MockEmbeddingProvider::new());
    let model = Arc::new(ScriptedChatModel::new());
    let store_dir = TempDir::new().expect("store dir");
    let config = EngineConfig::default()
        .with_store_root(store_dir.path())
        .with_cache_capacity(16);
    let engine = Engine::connect(
        config,
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
        Arc::clone(&model) as Arc<dyn ChatModel>,
    )
    .await
    .expect("engine connects");
    TestEngine {
        engine,
        fetcher,
        provider,
        model,
        _store_dir: store_dir,
    }
}

const VOCAB: [&str; 12] = [
    "storage",
    "engine",
    "retrieval",
    "cache",
    "index",
    "token",
    "vector",
    "search",
    "chunk",
    "digest",
    "tenant",
    "stream",
];

/// Builds an article of roughly `words` common words, split into
/// paragraph tags so the normalizer has real structure to walk.
pub fn prose_article(words: usize) -> String {
    let mut paragraphs = Vec::new();
    let mut sentence: Vec<&str> = Vec::with_capacity(60);
    for n in 0..words {
        sentence.push(VOCAB[n % VOCAB.len()]);
        if sentence.len() == 60 {
            paragraphs.push(format!("<p>{}.</p>", sentence.join(" ")));
            sentence.clear();
        }
    }
    if !sentence.is_empty() {
        paragraphs.push(format!("<p>{}.</p>", sentence.join(" ")));
    }
    format!(
        "<html><head><title>Saved Page</title></head><body><article>{}</article></body></html>",
        paragraphs.concat()
    )
}
