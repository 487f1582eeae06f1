//! Language-model seam: one-shot completions and token streaming.
//!
//! The generator, digest summarizer, and topic extraction all talk to a
//! [`ChatModel`]; production wires a provider adapter (see
//! `providers::rig` behind the `rig` feature), tests use
//! [`ScriptedChatModel`].

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ModelError {
    #[error("model provider error: {0}")]
    #[diagnostic(code(pagewright::chat::model))]
    Provider(String),
}

pub type TokenStream = BoxStream<'static, Result<String, ModelError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One-shot completion for the rendered prompt.
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    /// Incremental completion; the stream yields answer fragments in
    /// order and terminates on the first error.
    async fn stream(&self, prompt: &str) -> Result<TokenStream, ModelError>;
}

/// One scripted streaming answer: `tokens` are yielded in order, then
/// `error` (if any) terminates the stream.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    tokens: Vec<String>,
    error: Option<String>,
}

impl ScriptedStream {
    pub fn of<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            error: None,
        }
    }

    #[must_use]
    pub fn failing_after(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Deterministic model for tests: completions and streams are served
/// from FIFO scripts, and every completion prompt is recorded.
#[derive(Debug, Default)]
pub struct ScriptedChatModel {
    completions: Mutex<VecDeque<Result<String, ModelError>>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, text: impl Into<String>) -> &Self {
        self.completions.lock().push_back(Ok(text.into()));
        self
    }

    pub fn push_failing_completion(&self, error: impl Into<String>) -> &Self {
        self.completions
            .lock()
            .push_back(Err(ModelError::Provider(error.into())));
        self
    }

    pub fn push_stream(&self, script: ScriptedStream) -> &Self {
        self.streams.lock().push_back(script);
        self
    }

    /// Prompts seen by `complete`, in call order.
    pub fn completion_prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn completion_calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        self.prompts.lock().push(prompt.to_string());
        self.completions
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Provider("no scripted completion".into())))
    }

    async fn stream(&self, _prompt: &str) -> Result<TokenStream, ModelError> {
        let script = self
            .streams
            .lock()
            .pop_front()
            .ok_or_else(|| ModelError::Provider("no scripted stream".into()))?;
        let mut items: Vec<Result<String, ModelError>> =
            script.tokens.into_iter().map(Ok).collect();
        if let Some(error) = script.error {
            items.push(Err(ModelError::Provider(error)));
        }
        Ok(futures_util::stream::iter(items).boxed())
    }
}
