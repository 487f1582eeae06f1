//! Resource records: one row per canonical URL, tracking where the
//! normalized document and chunk artifacts live and how far indexing got.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::cache::keys::{chunk_key, parsed_doc_key, resource_id};
use crate::cache::{DocumentMeta, ResourceMetaSource};

use super::{StorageError, now_text, parse_timestamp};

/// Page-level metadata captured at fetch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_time: Option<String>,
}

/// One classified topic with its relevance score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicScore {
    pub key: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Derived metadata attached after ingestion; topics drive digest
/// accumulation and preference scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentMeta {
    #[serde(default)]
    pub topics: Vec<TopicScore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Processing,
    Finished,
    Failed,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Finished => "finish",
            Self::Failed => "failed",
        }
    }

    fn decode(raw: &str) -> Self {
        match raw {
            "finish" => Self::Finished,
            "failed" => Self::Failed,
            _ => Self::Processing,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub url: String,
    pub storage_key: String,
    pub chunk_storage_key: String,
    pub index_status: IndexStatus,
    pub page_meta: PageMeta,
    pub content_meta: ContentMeta,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct ResourceRepo {
    pool: SqlitePool,
}

impl ResourceRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the record for `url`, or resets an existing one back to
    /// `processing` for re-ingestion. The row id and storage keys are
    /// derived from the canonical URL, so the same page always maps to
    /// the same row.
    #[instrument(skip(self, page_meta), fields(url = %url))]
    pub async fn upsert(&self, url: &Url, page_meta: &PageMeta) -> Result<ResourceRecord, StorageError> {
        let id = resource_id(url);
        let now = now_text();
        sqlx::query(
            r#"
            INSERT INTO resources (
                id, url, storage_key, chunk_storage_key,
                index_status, page_meta, content_meta, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'processing', ?5, '{}', ?6, ?6)
            ON CONFLICT(id) DO UPDATE SET
                page_meta = excluded.page_meta,
                index_status = 'processing',
                updated_at = excluded.updated_at
        "#,
        )
        .bind(id.to_string())
        .bind(url.as_str())
        .bind(parsed_doc_key(url))
        .bind(chunk_key(url))
        .bind(serde_json::to_string(page_meta)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(url)
            .await?
            .ok_or_else(|| StorageError::Sqlx(sqlx::Error::RowNotFound))
    }

    pub async fn get(&self, url: &Url) -> Result<Option<ResourceRecord>, StorageError> {
        let row: Option<SqliteRow> = sqlx::query("SELECT * FROM resources WHERE id = ?1")
            .bind(resource_id(url).to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_resource).transpose()
    }

    #[instrument(skip(self), fields(url = %url, status = status.as_str()))]
    pub async fn set_status(&self, url: &Url, status: IndexStatus) -> Result<(), StorageError> {
        sqlx::query("UPDATE resources SET index_status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now_text())
            .bind(resource_id(url).to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_content_meta(
        &self,
        url: &Url,
        content_meta: &ContentMeta,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE resources SET content_meta = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(serde_json::to_string(content_meta)?)
            .bind(now_text())
            .bind(resource_id(url).to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Tier-2 cache hits recover title and published time from the resource
/// row instead of re-fetching the page.
#[async_trait]
impl ResourceMetaSource for ResourceRepo {
    async fn page_meta(&self, url: &Url) -> Option<DocumentMeta> {
        let record = self.get(url).await.ok()??;
        Some(DocumentMeta {
            title: record
                .page_meta
                .title
                .unwrap_or_else(|| record.url.clone()),
            published_time: record.page_meta.published_time,
        })
    }
}

fn row_to_resource(row: &SqliteRow) -> Result<ResourceRecord, StorageError> {
    let id_raw: String = row.get("id");
    let page_meta_raw: String = row.get("page_meta");
    let content_meta_raw: String = row.get("content_meta");
    let status_raw: String = row.get("index_status");
    let created_raw: String = row.get("created_at");
    let updated_raw: String = row.get("updated_at");
    Ok(ResourceRecord {
        id: Uuid::parse_str(&id_raw).unwrap_or(Uuid::nil()),
        url: row.get("url"),
        storage_key: row.get("storage_key"),
        chunk_storage_key: row.get("chunk_storage_key"),
        index_status: IndexStatus::decode(&status_raw),
        page_meta: serde_json::from_str(&page_meta_raw)?,
        content_meta: serde_json::from_str(&content_meta_raw)?,
        created_at: parse_timestamp(&created_raw),
        updated_at: parse_timestamp(&updated_raw),
    })
}
