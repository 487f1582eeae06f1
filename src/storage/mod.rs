//! Durable relational state: resource records, conversations and their
//! messages, digests, and topic preferences.
//!
//! Everything lives in one SQLite database behind a shared [`SqlitePool`];
//! embedded migrations (`sqlx::migrate!("./migrations")`) run on connect,
//! so a fresh database URL is immediately usable. Repos are thin handles
//! over the pool; timestamps are stored as RFC 3339 text and parsed
//! leniently on the way out.

mod digests;
mod resources;
mod sessions;

pub use digests::{DigestDocument, DigestRecord, DigestRepo, TopicPreference};
pub use resources::{ContentMeta, IndexStatus, PageMeta, ResourceRecord, ResourceRepo, TopicScore};
pub use sessions::{ConversationRecord, MessageDraft, MessageRecord, MessageRole, SessionRepo};

use std::str::FromStr;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("SQLx error: {0}")]
    #[diagnostic(
        code(pagewright::storage::sqlx),
        help("Ensure the SQLite database URL is valid and accessible.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failure: {0}")]
    #[diagnostic(
        code(pagewright::storage::migrate),
        help("The embedded migrations could not be applied to this database.")
    )]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON serialization error: {0}")]
    #[diagnostic(
        code(pagewright::storage::serde),
        help("Check serialized shapes for page/content metadata and sources.")
    )]
    Serde(#[from] serde_json::Error),
}

/// Connect (or create) a SQLite database at `database_url` and apply
/// embedded migrations. Example URL: "sqlite://pagewright.db".
#[instrument(skip(database_url))]
pub async fn connect(database_url: &str) -> Result<SqlitePool, StorageError> {
    // In-memory databases exist per connection; keep a single one so
    // every caller sees the same schema and rows.
    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?
    } else {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        SqlitePoolOptions::new().connect_with(options).await?
    };
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// RFC 3339 text for the current instant, the storage-wide timestamp form.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339()
}

/// Lenient timestamp parse; malformed rows fall back to now rather than
/// failing the whole query.
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    connect("sqlite::memory:").await.unwrap()
}
