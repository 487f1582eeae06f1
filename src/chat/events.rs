//! Tagged chat-turn event stream.
//!
//! One turn emits, in strict order: `Sources` once, `Token` zero or more
//! times, `RelatedQuestions` once, then `End`. A turn that fails
//! mid-stream skips straight to `End` carrying the error reason; the
//! channel always terminates so clients never hang. Serialized form uses
//! a `"type"` discriminator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::retrieval::RetrievedSource;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Sources {
        sources: Vec<RetrievedSource>,
    },
    Token {
        text: String,
    },
    RelatedQuestions {
        questions: Vec<String>,
    },
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ChatEvent {
    pub fn sources(sources: Vec<RetrievedSource>) -> Self {
        ChatEvent::Sources { sources }
    }

    pub fn token(text: impl Into<String>) -> Self {
        ChatEvent::Token { text: text.into() }
    }

    pub fn related(questions: Vec<String>) -> Self {
        ChatEvent::RelatedQuestions { questions }
    }

    pub fn end() -> Self {
        ChatEvent::End { error: None }
    }

    pub fn end_with_error(error: impl Into<String>) -> Self {
        ChatEvent::End {
            error: Some(error.into()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Sources { .. } => "sources",
            ChatEvent::Token { .. } => "token",
            ChatEvent::RelatedQuestions { .. } => "related_questions",
            ChatEvent::End { .. } => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::End { .. })
    }
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatEvent::Sources { sources } => write!(f, "[sources n={}]", sources.len()),
            ChatEvent::Token { text } => write!(f, "{text}"),
            ChatEvent::RelatedQuestions { questions } => {
                write!(f, "[related n={}]", questions.len())
            }
            ChatEvent::End { error: None } => write!(f, "[end]"),
            ChatEvent::End { error: Some(e) } => write!(f, "[end error={e}]"),
        }
    }
}

/// Consumer half of a turn's event channel. The stream ends when the
/// producer drops the sender, which always happens after a terminal
/// event.
pub struct ChatStream {
    receiver: flume::Receiver<ChatEvent>,
}

impl ChatStream {
    pub async fn next(&mut self) -> Option<ChatEvent> {
        self.receiver.recv_async().await.ok()
    }

    /// Drains the stream to completion; test and batch-consumer helper.
    pub async fn collect(mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatStream")
            .field("pending", &self.receiver.len())
            .finish()
    }
}

pub(crate) fn channel() -> (flume::Sender<ChatEvent>, ChatStream) {
    let (tx, rx) = flume::unbounded();
    (tx, ChatStream { receiver: rx })
}
