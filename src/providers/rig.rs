//! rig-core adapters.
//!
//! Wraps any rig [`EmbeddingModel`] or [`CompletionModel`] in the
//! engine's provider traits, so a deployment can plug in OpenAI, Ollama,
//! or any other rig-supported backend without the pipeline knowing:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rig::client::{CompletionClient, EmbeddingsClient};
//! use rig::providers::ollama;
//! use pagewright::providers::rig::{RigChatModel, RigEmbeddingProvider};
//!
//! let client = ollama::Client::new();
//! let embedding = Arc::new(RigEmbeddingProvider::new(
//!     client.embedding_model("nomic-embed-text"),
//! ));
//! let chat = Arc::new(
//!     RigChatModel::new(client.completion_model("gemma3:latest"))
//!         .with_temperature(0.3),
//! );
//! ```

use async_trait::async_trait;
use futures_util::StreamExt;
use rig::completion::{AssistantContent, CompletionModel, Message};
use rig::embeddings::EmbeddingModel;
use rig::streaming::StreamedAssistantContent;

use crate::chat::{ChatModel, ModelError, TokenStream};
use crate::embed::{EmbedError, EmbeddingProvider};

/// [`EmbeddingProvider`] over a rig [`EmbeddingModel`].
#[derive(Debug, Clone)]
pub struct RigEmbeddingProvider<M> {
    model: M,
}

impl<M: EmbeddingModel> RigEmbeddingProvider<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M> EmbeddingProvider for RigEmbeddingProvider<M>
where
    M: EmbeddingModel + 'static,
{
    fn dimensions(&self) -> usize {
        self.model.ndims()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let embeddings = self
            .model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|err| EmbedError::Provider(err.to_string()))?;
        Ok(embeddings
            .into_iter()
            .map(|embedding| embedding.vec.into_iter().map(|v| v as f32).collect())
            .collect())
    }
}

/// [`ChatModel`] over a rig [`CompletionModel`].
#[derive(Debug, Clone)]
pub struct RigChatModel<M> {
    model: M,
    preamble: Option<String>,
    temperature: Option<f64>,
}

impl<M: CompletionModel> RigChatModel<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            preamble: None,
            temperature: None,
        }
    }

    /// System preamble prepended to every request.
    #[must_use]
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn request(&self, prompt: &str) -> rig::completion::CompletionRequest {
        let mut builder = self
            .model
            .completion_request(Message::user(prompt.to_string()));
        if let Some(preamble) = &self.preamble {
            builder = builder.preamble(preamble.clone());
        }
        if let Some(temperature) = self.temperature {
            builder = builder.temperature(temperature);
        }
        builder.build()
    }
}

#[async_trait]
impl<M> ChatModel for RigChatModel<M>
where
    M: CompletionModel + 'static,
{
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let response = self
            .model
            .completion(self.request(prompt))
            .await
            .map_err(|err| ModelError::Provider(err.to_string()))?;
        let text: String = response
            .choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream, ModelError> {
        let response = self
            .model
            .stream(self.request(prompt))
            .await
            .map_err(|err| ModelError::Provider(err.to_string()))?;
        let tokens = response
            .filter_map(|item| async move {
                match item {
                    Ok(StreamedAssistantContent::Text(text)) => Some(Ok(text.text)),
                    Ok(_) => None,
                    Err(err) => Some(Err(ModelError::Provider(err.to_string()))),
                }
            })
            .boxed();
        Ok(tokens)
    }
}
