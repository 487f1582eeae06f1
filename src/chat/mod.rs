//! Conversational generator: one streamed, citation-grounded answer per
//! turn.
//!
//! Each turn walks a fixed state machine: persist the inbound human
//! message, rewrite the question against chat history (skipped when the
//! history is empty), retrieve grounding sources, stream the answer as
//! [`ChatEvent`]s, normalize citation markers, and persist the assistant
//! message. The event ordering contract is strict: `Sources`, then
//! `Token`s, then `RelatedQuestions`, then `End`. A mid-stream provider
//! failure terminates the channel with `End { error }` and skips
//! persistence; whatever was already flushed to the client stands.

mod citations;
mod events;
mod model;
pub(crate) mod parse;
pub mod prompts;

pub use citations::normalize_citations;
pub use events::{ChatEvent, ChatStream};
pub use model::{ChatModel, ModelError, ScriptedChatModel, ScriptedStream, TokenStream};

use std::sync::Arc;

use futures_util::StreamExt;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::retrieval::{RetrievalOrchestrator, SourceFilter};
use crate::storage::{MessageDraft, MessageRecord, SessionRepo, StorageError};

/// Cap on suggested follow-up questions per turn.
pub const MAX_RELATED_QUESTIONS: usize = 3;

/// Default number of recent messages considered for contextualization.
pub const DEFAULT_HISTORY_WINDOW: usize = 5;

#[derive(Debug, Error, Diagnostic)]
pub enum ChatError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
}

/// One inbound chat turn.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: String,
    pub conversation_id: Option<Uuid>,
    pub query: String,
    pub filter: Option<SourceFilter>,
}

impl ChatRequest {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: None,
            query: query.into(),
            filter: None,
        }
    }

    #[must_use]
    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Handle returned as soon as the turn is accepted: the session the turn
/// landed in plus the live event stream.
#[derive(Debug)]
pub struct TurnHandle {
    pub conversation_id: Uuid,
    pub events: ChatStream,
}

#[derive(Clone)]
pub struct ConversationalGenerator {
    sessions: SessionRepo,
    retrieval: Arc<RetrievalOrchestrator>,
    model: Arc<dyn ChatModel>,
    history_window: usize,
}

impl ConversationalGenerator {
    pub fn new(
        sessions: SessionRepo,
        retrieval: Arc<RetrievalOrchestrator>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            sessions,
            retrieval,
            model,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    #[must_use]
    pub fn with_history_window(mut self, history_window: usize) -> Self {
        self.history_window = history_window.max(1);
        self
    }

    /// Accepts a turn: finds or creates the session, persists the human
    /// message with its filter snapshot, and spawns the streaming state
    /// machine. Returns immediately with the event stream.
    ///
    /// An explicitly supplied filter is snapshotted on the human message;
    /// a follow-up without one inherits the latest snapshot in the
    /// conversation.
    #[instrument(skip(self, request), fields(user = %request.user_id))]
    pub async fn chat_turn(&self, mut request: ChatRequest) -> Result<TurnHandle, ChatError> {
        let session = self
            .sessions
            .find_or_create(&request.user_id, request.conversation_id)
            .await?;
        // History is captured before the inbound message lands, so "prior
        // turns exist" means turns before this one.
        let history = self
            .sessions
            .history(session.id, self.history_window * 2)
            .await?;
        self.sessions
            .append_message(
                MessageDraft::human(session.id, request.query.clone())
                    .with_filter(request.filter.clone()),
            )
            .await?;
        if request.filter.is_none() {
            request.filter = self.sessions.last_selected_filter(session.id).await?;
        }

        let (tx, stream) = events::channel();
        let generator = self.clone();
        let conversation_id = session.id;
        tokio::spawn(async move {
            generator.run_turn(conversation_id, request, history, tx).await;
        });
        Ok(TurnHandle {
            conversation_id,
            events: stream,
        })
    }

    async fn run_turn(
        self,
        conversation_id: Uuid,
        request: ChatRequest,
        history: Vec<MessageRecord>,
        tx: flume::Sender<ChatEvent>,
    ) {
        let query = self.contextualized_query(&history, &request.query).await;

        let sources = match self
            .retrieval
            .retrieve(&request.user_id, &query, request.filter.as_ref())
            .await
        {
            Ok(sources) => sources,
            Err(e) => {
                warn!(error = %e, "retrieval failed; terminating turn");
                let _ = tx.send(ChatEvent::end_with_error(e.to_string()));
                return;
            }
        };
        if tx.send(ChatEvent::sources(sources.clone())).is_err() {
            return;
        }

        // Related questions run concurrently with token streaming but are
        // emitted only after the last token.
        let related = {
            let model = Arc::clone(&self.model);
            let prompt = prompts::related_questions(&sources, &query);
            tokio::spawn(async move {
                match model.complete(&prompt).await {
                    Ok(raw) => parse::string_array(&raw, MAX_RELATED_QUESTIONS),
                    Err(e) => {
                        warn!(error = %e, "related questions failed; emitting empty list");
                        Vec::new()
                    }
                }
            })
        };

        let answer_prompt = prompts::grounded_answer(&sources, &query);
        let mut answer = String::new();
        let mut stream_error = None;
        match self.model.stream(&answer_prompt).await {
            Ok(mut tokens) => {
                while let Some(next) = tokens.next().await {
                    match next {
                        Ok(text) => {
                            answer.push_str(&text);
                            if tx.send(ChatEvent::token(text)).is_err() {
                                // Client closed the channel; abandon the
                                // turn without persisting.
                                debug!(%conversation_id, "client disconnected mid-stream");
                                return;
                            }
                        }
                        Err(e) => {
                            stream_error = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
            Err(e) => stream_error = Some(e.to_string()),
        }

        if let Some(reason) = stream_error {
            warn!(%conversation_id, error = %reason, "stream failed; not persisting turn");
            let _ = tx.send(ChatEvent::end_with_error(reason));
            return;
        }

        let questions = related.await.unwrap_or_default();
        if tx.send(ChatEvent::related(questions)).is_err() {
            return;
        }

        let normalized = normalize_citations(&answer);
        let draft = MessageDraft::assistant(conversation_id, normalized, sources);
        match self.sessions.append_message(draft).await {
            Ok(_) => {
                let _ = tx.send(ChatEvent::end());
            }
            Err(e) => {
                error!(%conversation_id, error = %e, "failed to persist assistant message");
                let _ = tx.send(ChatEvent::end_with_error(e.to_string()));
            }
        }
    }

    /// Pass-through on empty history; otherwise rewrite via the model,
    /// degrading to the raw query on failure.
    async fn contextualized_query(&self, history: &[MessageRecord], query: &str) -> String {
        if history.is_empty() {
            return query.to_string();
        }
        let prompt = prompts::contextualize(&prompts::render_history(history), query);
        match self.model.complete(&prompt).await {
            Ok(rewritten) if !rewritten.trim().is_empty() => rewritten.trim().to_string(),
            Ok(_) => query.to_string(),
            Err(e) => {
                warn!(error = %e, "context rewrite failed; using raw query");
                query.to_string()
            }
        }
    }
}

impl std::fmt::Debug for ConversationalGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationalGenerator")
            .field("history_window", &self.history_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use url::Url;

    use crate::cache::{DocumentCache, NoMeta, store::ObjectStore, store::StoreError};
    use crate::chunker::TokenChunker;
    use crate::embed::{Embedder, MockEmbeddingProvider};
    use crate::fetch::{FetchError, Fetcher};
    use crate::index::{Additional, ChunkPoint, IndexError, SearchFilter, SearchHit, TenantState, VectorIndex};
    use crate::normalize::PageSnapshot;
    use crate::storage::{MessageRole, test_pool};

    use super::*;

    struct NullStore;

    #[async_trait]
    impl ObjectStore for NullStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _body: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    struct NullFetcher;

    #[async_trait]
    impl Fetcher for NullFetcher {
        async fn fetch(&self, url: &Url) -> Result<PageSnapshot, FetchError> {
            Err(FetchError::Request {
                url: url.to_string(),
                message: "offline".into(),
            })
        }
    }

    struct FixedIndex {
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn ensure_tenant(&self, _tenant: &str) -> Result<TenantState, IndexError> {
            Ok(TenantState::Existing)
        }
        async fn upsert_chunks(
            &self,
            _tenant: &str,
            _url: &Url,
            _points: &[ChunkPoint],
        ) -> Result<(), IndexError> {
            Ok(())
        }
        async fn hybrid_search(
            &self,
            _tenant: &str,
            _query: &str,
            _vector: Option<&[f32]>,
            _filter: Option<&SearchFilter>,
            limit: usize,
        ) -> Result<Vec<SearchHit>, IndexError> {
            Ok(self.hits.iter().take(limit).cloned().collect())
        }
        async fn count(&self, _tenant: &str) -> Result<u64, IndexError> {
            Ok(self.hits.len() as u64)
        }
    }

    async fn generator(model: Arc<ScriptedChatModel>) -> ConversationalGenerator {
        let pool = test_pool().await;
        let cache = Arc::new(DocumentCache::new(
            8,
            Arc::new(NullStore),
            Arc::new(NoMeta),
            Arc::new(NullFetcher),
        ));
        let index = Arc::new(FixedIndex {
            hits: vec![SearchHit {
                url: "https://e.com/doc".into(),
                kind: "weblink".into(),
                title: "Doc".into(),
                content: "relevant snippet".into(),
                additional: Additional {
                    score: 0.8,
                    explain_score: "fused=0.8".into(),
                },
            }],
        });
        let embedder = Arc::new(Embedder::new(Arc::new(MockEmbeddingProvider::default())));
        let retrieval = Arc::new(RetrievalOrchestrator::new(
            cache,
            index,
            embedder,
            TokenChunker::new(800, 400).unwrap(),
        ));
        ConversationalGenerator::new(SessionRepo::new(pool), retrieval, model)
    }

    fn kinds(events: &[ChatEvent]) -> Vec<&'static str> {
        events.iter().map(ChatEvent::kind).collect()
    }

    #[tokio::test]
    async fn events_follow_the_ordering_contract() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion(r#"["follow up?"]"#);
        model.push_stream(ScriptedStream::of(["The answer ", "[citation:1]", "."]));
        let generator = generator(model).await;

        let handle = generator
            .chat_turn(ChatRequest::new("user-1", "what is X?"))
            .await
            .unwrap();
        let events = handle.events.collect().await;

        assert_eq!(
            kinds(&events),
            vec!["sources", "token", "token", "token", "related_questions", "end"]
        );
        assert!(matches!(events.last(), Some(ChatEvent::End { error: None })));
    }

    #[tokio::test]
    async fn empty_history_skips_context_rewrite() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion(r#"["next?"]"#);
        model.push_stream(ScriptedStream::of(["answer"]));
        let generator = generator(model.clone()).await;

        generator
            .chat_turn(ChatRequest::new("user-1", "what is X?"))
            .await
            .unwrap()
            .events
            .collect()
            .await;

        // Only the related-questions completion ran.
        assert_eq!(model.completion_calls(), 1);
        assert!(model.completion_prompts()[0].contains("follow-up"));
    }

    #[tokio::test]
    async fn prior_turns_trigger_context_rewrite() {
        let model = Arc::new(ScriptedChatModel::new());
        // First turn: related questions + stream.
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["first answer"]));
        // Second turn: rewrite, then related questions, then stream.
        model.push_completion("standalone question about X");
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["second answer"]));
        let generator = generator(model.clone()).await;

        let first = generator
            .chat_turn(ChatRequest::new("user-1", "what is X?"))
            .await
            .unwrap();
        let conversation_id = first.conversation_id;
        first.events.collect().await;

        generator
            .chat_turn(
                ChatRequest::new("user-1", "and why?").in_conversation(conversation_id),
            )
            .await
            .unwrap()
            .events
            .collect()
            .await;

        let prompts = model.completion_prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("Standalone question"));
        assert!(prompts[1].contains("what is X?"));
    }

    #[tokio::test]
    async fn completed_turn_persists_normalized_assistant_message() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["grounded ", "[[citation:1]]"]));
        let generator = generator(model).await;

        let handle = generator
            .chat_turn(ChatRequest::new("user-1", "what is X?"))
            .await
            .unwrap();
        handle.events.collect().await;

        let history = generator
            .sessions
            .history(handle.conversation_id, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].content, "grounded [citation:1]");
        assert_eq!(history[1].sources.len(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_cleanly_without_persisting() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["partial "]).failing_after("provider down"));
        let generator = generator(model).await;

        let handle = generator
            .chat_turn(ChatRequest::new("user-1", "what is X?"))
            .await
            .unwrap();
        let events = handle.events.collect().await;

        assert_eq!(kinds(&events), vec!["sources", "token", "end"]);
        let Some(ChatEvent::End { error: Some(reason) }) = events.last() else {
            panic!("expected terminal error event");
        };
        assert!(reason.contains("provider down"));

        let history = generator
            .sessions
            .history(handle.conversation_id, 10)
            .await
            .unwrap();
        // Only the human message survived.
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::Human);
    }

    #[tokio::test]
    async fn unparseable_related_questions_degrade_to_empty() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion("I cannot produce JSON today");
        model.push_stream(ScriptedStream::of(["answer"]));
        let generator = generator(model).await;

        let events = generator
            .chat_turn(ChatRequest::new("user-1", "what is X?"))
            .await
            .unwrap()
            .events
            .collect()
            .await;

        let related = events
            .iter()
            .find_map(|event| match event {
                ChatEvent::RelatedQuestions { questions } => Some(questions.clone()),
                _ => None,
            })
            .unwrap();
        assert!(related.is_empty());
    }

    #[tokio::test]
    async fn human_message_snapshots_selection_filter() {
        let model = Arc::new(ScriptedChatModel::new());
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["scoped answer"]));
        let generator = generator(model).await;

        let filter = SourceFilter::for_urls(["https://e.com/doc"]);
        let handle = generator
            .chat_turn(
                ChatRequest::new("user-1", "what does it say?").with_filter(filter.clone()),
            )
            .await
            .unwrap();
        handle.events.collect().await;

        let stored = generator
            .sessions
            .last_selected_filter(handle.conversation_id)
            .await
            .unwrap();
        assert_eq!(stored, Some(filter));
    }

    #[tokio::test]
    async fn follow_up_without_filter_inherits_the_snapshot() {
        use crate::retrieval::SourceSelection;

        let model = Arc::new(ScriptedChatModel::new());
        // First turn: related questions + stream.
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["one"]));
        // Second turn: rewrite, related questions, stream.
        model.push_completion("standalone");
        model.push_completion("[]");
        model.push_stream(ScriptedStream::of(["two"]));
        let generator = generator(model).await;

        let filter = SourceFilter {
            selections: vec![SourceSelection {
                url: "https://e.com/doc".into(),
                title: Some("Doc".into()),
                selected_text: Some("the picked passage".into()),
            }],
        };
        let first = generator
            .chat_turn(ChatRequest::new("user-1", "about this?").with_filter(filter))
            .await
            .unwrap();
        let conversation_id = first.conversation_id;
        first.events.collect().await;

        let events = generator
            .chat_turn(ChatRequest::new("user-1", "and more?").in_conversation(conversation_id))
            .await
            .unwrap()
            .events
            .collect()
            .await;

        let sources = events
            .iter()
            .find_map(|event| match event {
                ChatEvent::Sources { sources } => Some(sources.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(sources.len(), 1, "inherited selection should scope retrieval");
        assert_eq!(sources[0].text, "the picked passage");
    }
}
