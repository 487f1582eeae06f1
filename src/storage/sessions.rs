//! Conversation sessions and their message history.
//!
//! Sessions keep a rolling `last_message`/`message_count`; every message
//! stores a snapshot of the sources it was grounded in, and human turns
//! additionally carry the selection filter that was active, so follow-ups
//! can reuse the same source scope.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;
use uuid::Uuid;

use crate::retrieval::{RetrievedSource, SourceFilter};

use super::{StorageError, now_text, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    Human,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Assistant => "assistant",
        }
    }

    fn decode(raw: &str) -> Self {
        match raw {
            "assistant" => Self::Assistant,
            _ => Self::Human,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub user_id: String,
    pub last_message: Option<String>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub sources: Vec<RetrievedSource>,
    pub selected_filter: Option<SourceFilter>,
    pub created_at: DateTime<Utc>,
}

/// A message about to be appended; ids and timestamps are assigned on
/// insert.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub sources: Vec<RetrievedSource>,
    pub selected_filter: Option<SourceFilter>,
}

impl MessageDraft {
    pub fn human(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role: MessageRole::Human,
            content: content.into(),
            sources: Vec::new(),
            selected_filter: None,
        }
    }

    pub fn assistant(
        conversation_id: Uuid,
        content: impl Into<String>,
        sources: Vec<RetrievedSource>,
    ) -> Self {
        Self {
            conversation_id,
            role: MessageRole::Assistant,
            content: content.into(),
            sources,
            selected_filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Option<SourceFilter>) -> Self {
        self.selected_filter = filter;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the conversation with `id` if it exists, otherwise creates
    /// it for `user_id`. Passing `None` always creates a fresh session.
    #[instrument(skip(self))]
    pub async fn find_or_create(
        &self,
        user_id: &str,
        id: Option<Uuid>,
    ) -> Result<ConversationRecord, StorageError> {
        if let Some(id) = id
            && let Some(existing) = self.get(id).await?
        {
            return Ok(existing);
        }
        let id = id.unwrap_or_else(Uuid::new_v4);
        let now = now_text();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, last_message, message_count, created_at, updated_at)
            VALUES (?1, ?2, NULL, 0, ?3, ?3)
            ON CONFLICT(id) DO NOTHING
        "#,
        )
        .bind(id.to_string())
        .bind(user_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get(id)
            .await?
            .ok_or_else(|| StorageError::Sqlx(sqlx::Error::RowNotFound))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ConversationRecord>, StorageError> {
        let row: Option<SqliteRow> = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    /// Inserts the message and bumps the session's rolling counters in one
    /// transaction.
    #[instrument(skip(self, draft), fields(conversation = %draft.conversation_id, role = draft.role.as_str()))]
    pub async fn append_message(&self, draft: MessageDraft) -> Result<MessageRecord, StorageError> {
        let id = Uuid::new_v4();
        let now = now_text();
        let sources_json = serde_json::to_string(&draft.sources)?;
        let filter_json = draft
            .selected_filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, sources, selected_filter, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        )
        .bind(id.to_string())
        .bind(draft.conversation_id.to_string())
        .bind(draft.role.as_str())
        .bind(&draft.content)
        .bind(&sources_json)
        .bind(&filter_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message = ?1, message_count = message_count + 1, updated_at = ?2
            WHERE id = ?3
        "#,
        )
        .bind(&draft.content)
        .bind(&now)
        .bind(draft.conversation_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(MessageRecord {
            id,
            conversation_id: draft.conversation_id,
            role: draft.role,
            content: draft.content,
            sources: draft.sources,
            selected_filter: draft.selected_filter,
            created_at: parse_timestamp(&now),
        })
    }

    /// The most recent `limit` messages, oldest first.
    pub async fn history(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
        "#,
        )
        .bind(conversation_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Walks history backwards for the nearest human turn that carried a
    /// selection filter; lets follow-up questions stay scoped to the same
    /// sources.
    pub async fn last_selected_filter(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<SourceFilter>, StorageError> {
        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT selected_filter FROM messages
            WHERE conversation_id = ?1 AND selected_filter IS NOT NULL
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
        "#,
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let raw: String = row.get("selected_filter");
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

fn row_to_conversation(row: &SqliteRow) -> Result<ConversationRecord, StorageError> {
    let id_raw: String = row.get("id");
    let created_raw: String = row.get("created_at");
    let updated_raw: String = row.get("updated_at");
    Ok(ConversationRecord {
        id: Uuid::parse_str(&id_raw).unwrap_or(Uuid::nil()),
        user_id: row.get("user_id"),
        last_message: row.get("last_message"),
        message_count: row.get("message_count"),
        created_at: parse_timestamp(&created_raw),
        updated_at: parse_timestamp(&updated_raw),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<MessageRecord, StorageError> {
    let id_raw: String = row.get("id");
    let conversation_raw: String = row.get("conversation_id");
    let role_raw: String = row.get("role");
    let sources_raw: String = row.get("sources");
    let filter_raw: Option<String> = row.get("selected_filter");
    let created_raw: String = row.get("created_at");
    Ok(MessageRecord {
        id: Uuid::parse_str(&id_raw).unwrap_or(Uuid::nil()),
        conversation_id: Uuid::parse_str(&conversation_raw).unwrap_or(Uuid::nil()),
        role: MessageRole::decode(&role_raw),
        content: row.get("content"),
        sources: serde_json::from_str(&sources_raw)?,
        selected_filter: filter_raw.as_deref().map(serde_json::from_str).transpose()?,
        created_at: parse_timestamp(&created_raw),
    })
}
