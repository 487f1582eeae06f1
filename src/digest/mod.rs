//! Idempotent digest accumulation.
//!
//! A digest bucket is keyed by (user, date, topic). The first source
//! seeds it with a single-source summary; each later source merges into
//! the running content via the summarization collaborator. A resource id
//! contributes at most once: replaying a source is a no-op that calls no
//! summarizer and changes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::chat::{ChatModel, ModelError, prompts};
use crate::normalize::NormalizedDocument;
use crate::storage::{DigestDocument, DigestRecord, DigestRepo, StorageError, TopicScore};

#[derive(Debug, Error, Diagnostic)]
pub enum DigestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Model(#[from] ModelError),
}

/// Summarization collaborator: seed a digest from one document, or fold
/// a new document into an existing digest.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn seed(&self, doc: &NormalizedDocument) -> Result<DigestDocument, ModelError>;

    async fn merge(
        &self,
        existing: &DigestDocument,
        doc: &NormalizedDocument,
    ) -> Result<DigestDocument, ModelError>;
}

/// Model-backed summarizer. Responses are expected to be JSON digest
/// objects but are parsed leniently; unparseable output falls back to
/// the raw completion text.
pub struct ModelSummarizer {
    model: Arc<dyn ChatModel>,
}

impl ModelSummarizer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    fn parse_digest(raw: &str, fallback_title: &str) -> DigestDocument {
        if let Some(value) = crate::chat::parse::loose_json(raw)
            && let Ok(doc) = serde_json::from_value::<DigestDocument>(value)
            && !doc.text.trim().is_empty()
        {
            return doc;
        }
        DigestDocument {
            title: fallback_title.to_string(),
            text: raw.trim().to_string(),
        }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn seed(&self, doc: &NormalizedDocument) -> Result<DigestDocument, ModelError> {
        let body = prompts::excerpt(&doc.text, prompts::PROMPT_EXCERPT_CHARS);
        let prompt = prompts::single_source_summary(&doc.title, body);
        let raw = self.model.complete(&prompt).await?;
        Ok(Self::parse_digest(&raw, &doc.title))
    }

    async fn merge(
        &self,
        existing: &DigestDocument,
        doc: &NormalizedDocument,
    ) -> Result<DigestDocument, ModelError> {
        let body = prompts::excerpt(&doc.text, prompts::PROMPT_EXCERPT_CHARS);
        let prompt = prompts::merge_summaries(existing, &doc.title, body);
        let raw = self.model.complete(&prompt).await?;
        Ok(Self::parse_digest(&raw, &existing.title))
    }
}

/// What `upsert` did to the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestOutcome {
    Seeded,
    Merged,
    Unchanged,
}

pub struct DigestAccumulator {
    repo: DigestRepo,
    summarizer: Arc<dyn Summarizer>,
}

impl DigestAccumulator {
    pub fn new(repo: DigestRepo, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { repo, summarizer }
    }

    /// Seeds, merges, or no-ops the (user, date, topic) bucket for one
    /// contributing resource.
    #[instrument(skip(self, doc), fields(user = user_id, topic = topic_key, resource = resource_id))]
    pub async fn upsert(
        &self,
        user_id: &str,
        date: NaiveDate,
        topic_key: &str,
        resource_id: &str,
        doc: &NormalizedDocument,
    ) -> Result<(DigestRecord, DigestOutcome), DigestError> {
        match self.repo.get(user_id, date, topic_key).await? {
            None => {
                let content = self.summarizer.seed(doc).await?;
                let record = DigestRecord {
                    user_id: user_id.to_string(),
                    date,
                    topic_key: topic_key.to_string(),
                    content,
                    resource_ids: vec![resource_id.to_string()],
                    updated_at: chrono::Utc::now(),
                };
                self.repo.put(&record).await?;
                debug!("seeded digest bucket");
                Ok((record, DigestOutcome::Seeded))
            }
            Some(existing) if existing.resource_ids.iter().any(|id| id == resource_id) => {
                Ok((existing, DigestOutcome::Unchanged))
            }
            Some(mut existing) => {
                existing.content = self.summarizer.merge(&existing.content, doc).await?;
                existing.resource_ids.push(resource_id.to_string());
                existing.updated_at = chrono::Utc::now();
                self.repo.put(&existing).await?;
                debug!(contributions = existing.resource_ids.len(), "merged digest bucket");
                Ok((existing, DigestOutcome::Merged))
            }
        }
    }

    /// Runs `upsert` for every classified topic of a source and bumps the
    /// user's preference scores. Preferences only move when the source
    /// actually contributed, so replays change nothing.
    pub async fn record_topics(
        &self,
        user_id: &str,
        date: NaiveDate,
        topics: &[TopicScore],
        resource_id: &str,
        doc: &NormalizedDocument,
    ) -> Result<(), DigestError> {
        for topic in topics {
            let (_, outcome) = self
                .upsert(user_id, date, &topic.key, resource_id, doc)
                .await?;
            if outcome != DigestOutcome::Unchanged {
                self.repo
                    .bump_preference(user_id, &topic.key, topic.score)
                    .await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestAccumulator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::chat::ScriptedChatModel;
    use crate::storage::test_pool;

    use super::*;

    #[derive(Default)]
    struct CountingSummarizer {
        seeds: AtomicUsize,
        merges: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn seed(&self, doc: &NormalizedDocument) -> Result<DigestDocument, ModelError> {
            self.seeds.fetch_add(1, Ordering::SeqCst);
            Ok(DigestDocument {
                title: doc.title.clone(),
                text: format!("summary of {}", doc.source_url),
            })
        }

        async fn merge(
            &self,
            existing: &DigestDocument,
            doc: &NormalizedDocument,
        ) -> Result<DigestDocument, ModelError> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            Ok(DigestDocument {
                title: existing.title.clone(),
                text: format!("{} + {}", existing.text, doc.source_url),
            })
        }
    }

    fn doc(url: &str) -> NormalizedDocument {
        NormalizedDocument {
            title: "Doc".into(),
            text: "body".into(),
            published_time: None,
            source_url: url.into(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 24).unwrap()
    }

    #[tokio::test]
    async fn seed_merge_then_replay_is_idempotent() {
        let summarizer = Arc::new(CountingSummarizer::default());
        let accumulator =
            DigestAccumulator::new(DigestRepo::new(test_pool().await), summarizer.clone());

        let (first, outcome) = accumulator
            .upsert("42", date(), "ai", "s1", &doc("https://e.com/s1"))
            .await
            .unwrap();
        assert_eq!(outcome, DigestOutcome::Seeded);
        assert_eq!(first.resource_ids, vec!["s1".to_string()]);

        let (second, outcome) = accumulator
            .upsert("42", date(), "ai", "s2", &doc("https://e.com/s2"))
            .await
            .unwrap();
        assert_eq!(outcome, DigestOutcome::Merged);
        assert_eq!(
            second.resource_ids,
            vec!["s1".to_string(), "s2".to_string()]
        );

        let (replayed, outcome) = accumulator
            .upsert("42", date(), "ai", "s1", &doc("https://e.com/s1"))
            .await
            .unwrap();
        assert_eq!(outcome, DigestOutcome::Unchanged);
        assert_eq!(
            replayed.resource_ids,
            vec!["s1".to_string(), "s2".to_string()]
        );

        // One seed for s1, one merge for s2, nothing for the replay.
        assert_eq!(summarizer.seeds.load(Ordering::SeqCst), 1);
        assert_eq!(summarizer.merges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replaying_a_doc_calls_the_summarizer_only_once() {
        let summarizer = Arc::new(CountingSummarizer::default());
        let accumulator =
            DigestAccumulator::new(DigestRepo::new(test_pool().await), summarizer.clone());

        for _ in 0..2 {
            accumulator
                .upsert("42", date(), "ai", "s1", &doc("https://e.com/s1"))
                .await
                .unwrap();
        }
        assert_eq!(summarizer.seeds.load(Ordering::SeqCst), 1);
        assert_eq!(summarizer.merges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn topic_recording_bumps_preferences_once_per_contribution() {
        let pool = test_pool().await;
        let repo = DigestRepo::new(pool);
        let accumulator =
            DigestAccumulator::new(repo.clone(), Arc::new(CountingSummarizer::default()));
        let topics = vec![
            TopicScore {
                key: "ai".into(),
                score: 0.8,
                reason: None,
            },
            TopicScore {
                key: "rust".into(),
                score: 0.5,
                reason: None,
            },
        ];

        accumulator
            .record_topics("42", date(), &topics, "s1", &doc("https://e.com/s1"))
            .await
            .unwrap();
        // Replay: no contribution, no preference movement.
        accumulator
            .record_topics("42", date(), &topics, "s1", &doc("https://e.com/s1"))
            .await
            .unwrap();

        let prefs = repo.preferences("42").await.unwrap();
        assert_eq!(prefs.len(), 2);
        assert!((prefs[0].score - 0.8).abs() < 1e-9);
        assert!((prefs[1].score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn model_summarizer_falls_back_on_unparseable_output() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion("just prose, no json");
        let summarizer = ModelSummarizer::new(model);

        let digest = summarizer.seed(&doc("https://e.com/s1")).await.unwrap();
        assert_eq!(digest.title, "Doc");
        assert_eq!(digest.text, "just prose, no json");
    }

    #[tokio::test]
    async fn model_summarizer_accepts_fenced_json() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion("```json\n{\"title\": \"AI digest\", \"text\": \"merged\"}\n```");
        let summarizer = ModelSummarizer::new(model);

        let digest = summarizer.seed(&doc("https://e.com/s1")).await.unwrap();
        assert_eq!(digest.title, "AI digest");
        assert_eq!(digest.text, "merged");
    }
}
