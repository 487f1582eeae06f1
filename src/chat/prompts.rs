//! Prompt construction for every model call the engine makes:
//! contextualization, grounded answers, related questions, digest
//! summaries, and topic extraction. All builders are pure string
//! functions so they can be asserted on directly.

use crate::retrieval::RetrievedSource;
use crate::storage::{DigestDocument, MessageRecord, MessageRole};

/// Character budget applied to document bodies before they enter a
/// summary or classification prompt.
pub const PROMPT_EXCERPT_CHARS: usize = 12_000;

/// First `max_chars` characters of `text`, cut on a char boundary.
pub fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::Human => "Human",
        MessageRole::Assistant => "Assistant",
    }
}

/// Chat history as alternating `Role: content` lines.
pub fn render_history(history: &[MessageRecord]) -> String {
    history
        .iter()
        .map(|message| format!("{}: {}", role_label(message.role), message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rewrite a follow-up into a standalone question.
pub fn contextualize(history_block: &str, question: &str) -> String {
    format!(
        "Given the conversation so far, rewrite the user's latest question as a \
         standalone question that can be understood without any prior context. \
         Return only the rewritten question.\n\n\
         Conversation:\n{history_block}\n\n\
         Latest question: {question}\n\n\
         Standalone question:"
    )
}

/// Context blocks labeled `[[citation:N]]`, 1-based in source order.
pub fn citation_blocks(sources: &[RetrievedSource]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            format!(
                "[[citation:{}]] {} ({})\n{}",
                i + 1,
                source.metadata.title,
                source.metadata.url,
                source.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Answer prompt: grounded in the numbered context, citing inline as
/// `[citation:N]`.
pub fn grounded_answer(sources: &[RetrievedSource], question: &str) -> String {
    format!(
        "Answer the question using only the context below. Cite supporting \
         sources inline as [citation:N], where N is the context block number. \
         If the context does not cover the question, say you don't know.\n\n\
         Context:\n===\n{}\n===\n\n\
         Question: {question}\n\
         Answer:",
        citation_blocks(sources)
    )
}

/// Follow-up suggestions; the answer must be a JSON array of strings.
pub fn related_questions(sources: &[RetrievedSource], question: &str) -> String {
    format!(
        "Based on the context and the user's question, suggest at most three \
         short follow-up questions the user is likely to ask next. Respond with \
         a JSON array of strings and nothing else.\n\n\
         Context:\n===\n{}\n===\n\n\
         Question: {question}",
        citation_blocks(sources)
    )
}

/// Seed summary of a single source document.
pub fn single_source_summary(title: &str, text: &str) -> String {
    format!(
        "Summarize the following document into a concise digest. Respond with a \
         JSON object {{\"title\": string, \"text\": string}} and nothing else.\n\n\
         Document title: {title}\n\
         Document:\n===\n{text}\n===",
    )
}

/// Incremental merge: fold a new document into an existing digest.
pub fn merge_summaries(digest: &DigestDocument, title: &str, text: &str) -> String {
    format!(
        "Merge the new document into the existing digest, keeping the result \
         concise and coherent. Respond with a JSON object \
         {{\"title\": string, \"text\": string}} and nothing else.\n\n\
         Existing digest ({}):\n===\n{}\n===\n\n\
         New document title: {title}\n\
         New document:\n===\n{text}\n===",
        digest.title, digest.text
    )
}

/// Topic classification for content metadata. Keys are short kebab-case
/// labels; scores are 0..1 relevance.
pub fn topic_extraction(title: &str, text: &str) -> String {
    format!(
        "Classify the document into topics. Respond with a JSON object \
         {{\"topics\": [{{\"key\": string, \"score\": number, \"reason\": string}}]}} \
         and nothing else, with at most three topics, kebab-case keys, and \
         scores between 0 and 1.\n\n\
         Document title: {title}\n\
         Document:\n===\n{text}\n===",
    )
}
