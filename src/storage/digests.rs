//! Digest buckets and topic preference scores.
//!
//! A digest row is keyed by (user, date, topic) and carries the running
//! synthesized document plus the resource ids that contributed to it.
//! Merge semantics live in the digest service; this repo only persists.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use super::{StorageError, now_text, parse_timestamp};

/// The synthesized digest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DigestDocument {
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigestRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub topic_key: String,
    pub content: DigestDocument,
    pub resource_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicPreference {
    pub topic_key: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct DigestRepo {
    pool: SqlitePool,
}

impl DigestRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        user_id: &str,
        date: NaiveDate,
        topic_key: &str,
    ) -> Result<Option<DigestRecord>, StorageError> {
        let row: Option<SqliteRow> = sqlx::query(
            "SELECT * FROM digests WHERE user_id = ?1 AND date = ?2 AND topic_key = ?3",
        )
        .bind(user_id)
        .bind(date.to_string())
        .bind(topic_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_digest).transpose()
    }

    /// Writes the whole bucket; callers hold the merged state.
    #[instrument(skip(self, record), fields(user = %record.user_id, topic = %record.topic_key))]
    pub async fn put(&self, record: &DigestRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO digests (user_id, date, topic_key, content, resource_ids, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, date, topic_key) DO UPDATE SET
                content = excluded.content,
                resource_ids = excluded.resource_ids,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&record.user_id)
        .bind(record.date.to_string())
        .bind(&record.topic_key)
        .bind(serde_json::to_string(&record.content)?)
        .bind(serde_json::to_string(&record.resource_ids)?)
        .bind(now_text())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Adds `by` to the user's score for `topic_key`, creating the row on
    /// first sight.
    pub async fn bump_preference(
        &self,
        user_id: &str,
        topic_key: &str,
        by: f64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO topic_preferences (user_id, topic_key, score, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, topic_key) DO UPDATE SET
                score = topic_preferences.score + excluded.score,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(user_id)
        .bind(topic_key)
        .bind(by)
        .bind(now_text())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All of a user's topic scores, strongest first.
    pub async fn preferences(&self, user_id: &str) -> Result<Vec<TopicPreference>, StorageError> {
        let rows = sqlx::query(
            "SELECT topic_key, score FROM topic_preferences WHERE user_id = ?1 ORDER BY score DESC, topic_key ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| TopicPreference {
                topic_key: row.get("topic_key"),
                score: row.get("score"),
            })
            .collect())
    }
}

fn row_to_digest(row: &SqliteRow) -> Result<DigestRecord, StorageError> {
    let date_raw: String = row.get("date");
    let content_raw: String = row.get("content");
    let resources_raw: String = row.get("resource_ids");
    let updated_raw: String = row.get("updated_at");
    Ok(DigestRecord {
        user_id: row.get("user_id"),
        date: date_raw.parse().unwrap_or_else(|_| Utc::now().date_naive()),
        topic_key: row.get("topic_key"),
        content: serde_json::from_str(&content_raw)?,
        resource_ids: serde_json::from_str(&resources_raw)?,
        updated_at: parse_timestamp(&updated_raw),
    })
}
