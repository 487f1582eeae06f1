use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use url::Url;

use crate::cache::keys::chunk_point_id;

use super::fusion::{blob_to_vec, cosine_similarity, fuse, normalize_scores, vec_to_blob};
use super::{Additional, ChunkPoint, IndexError, SearchFilter, SearchHit, TenantState, VectorIndex};

/// How many candidates each retrieval channel contributes before fusion,
/// as a multiple of the requested limit.
const CANDIDATE_FACTOR: usize = 4;

/// Hybrid index over the `points` table and its FTS5 shadow.
///
/// Dense scores are cosine similarity against stored embeddings; sparse
/// scores come from FTS5's bm25 rank. Both channels are min-max
/// normalized per query and fused as `alpha * dense + (1 - alpha) *
/// sparse`.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    alpha: f64,
    ensured: Mutex<FxHashSet<String>>,
}

impl fmt::Debug for SqliteVectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteVectorIndex")
            .field("alpha", &self.alpha)
            .finish_non_exhaustive()
    }
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, alpha: f64) -> Self {
        Self {
            pool,
            alpha,
            ensured: Mutex::new(FxHashSet::default()),
        }
    }

    /// Candidate rows for the dense channel: every embedded point in the
    /// tenant, optionally restricted to an URL allow-list.
    async fn dense_candidates(
        &self,
        tenant: &str,
        vector: &[f32],
        filter: Option<&SearchFilter>,
        take: usize,
    ) -> Result<Vec<(String, f64)>, IndexError> {
        let mut sql = String::from("SELECT id, embedding FROM points WHERE tenant = ?");
        push_url_filter(&mut sql, filter);

        let mut query = sqlx::query(&sql).bind(tenant);
        query = bind_url_filter(query, filter);

        let rows = query.fetch_all(&self.pool).await?;
        let mut scored: Vec<(String, f64)> = rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                let blob: Vec<u8> = row.get("embedding");
                let score = f64::from(cosine_similarity(vector, &blob_to_vec(&blob)));
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(take);
        Ok(scored)
    }

    /// Candidate rows for the sparse channel. FTS5's bm25 rank is lower
    /// for better matches, so the raw score is the negated rank.
    async fn sparse_candidates(
        &self,
        tenant: &str,
        query_text: &str,
        filter: Option<&SearchFilter>,
        take: usize,
    ) -> Result<Vec<(String, f64)>, IndexError> {
        let Some(expression) = fts_match_expression(query_text) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT points_fts.point_id AS id, points_fts.rank AS rank \
             FROM points_fts \
             JOIN points p ON p.id = points_fts.point_id \
             WHERE points_fts MATCH ? AND p.tenant = ?",
        );
        push_url_filter_aliased(&mut sql, filter, "p");
        sql.push_str(" ORDER BY points_fts.rank LIMIT ?");

        let mut query = sqlx::query(&sql).bind(expression).bind(tenant);
        query = bind_url_filter(query, filter);
        query = query.bind(take as i64);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                let rank: f64 = row.get("rank");
                (id, -rank)
            })
            .collect())
    }

    async fn fetch_points(
        &self,
        ids: &[String],
    ) -> Result<FxHashMap<String, (String, String, String, String)>, IndexError> {
        if ids.is_empty() {
            return Ok(FxHashMap::default());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, url, kind, title, content FROM points WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get("id"),
                    (
                        row.get("url"),
                        row.get("kind"),
                        row.get("title"),
                        row.get("content"),
                    ),
                )
            })
            .collect())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn ensure_tenant(&self, tenant: &str) -> Result<TenantState, IndexError> {
        if self.ensured.lock().contains(tenant) {
            return Ok(TenantState::Existing);
        }
        let result =
            sqlx::query("INSERT INTO tenants (id, created_at) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
                .bind(tenant)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        self.ensured.lock().insert(tenant.to_string());
        if result.rows_affected() > 0 {
            debug!(tenant, "created tenant partition");
            Ok(TenantState::Created)
        } else {
            Ok(TenantState::Existing)
        }
    }

    async fn upsert_chunks(
        &self,
        tenant: &str,
        url: &Url,
        points: &[ChunkPoint],
    ) -> Result<(), IndexError> {
        self.ensure_tenant(tenant).await?;

        let mut tx = self.pool.begin().await?;
        for (ordinal, point) in points.iter().enumerate() {
            let id = chunk_point_id(url, ordinal).to_string();
            sqlx::query(
                "INSERT INTO points (id, tenant, url, kind, title, content, embedding, ordinal) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                     tenant = excluded.tenant, \
                     url = excluded.url, \
                     kind = excluded.kind, \
                     title = excluded.title, \
                     content = excluded.content, \
                     embedding = excluded.embedding, \
                     ordinal = excluded.ordinal",
            )
            .bind(&id)
            .bind(tenant)
            .bind(&point.url)
            .bind(&point.kind)
            .bind(&point.title)
            .bind(&point.content)
            .bind(vec_to_blob(&point.vector))
            .bind(ordinal as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM points_fts WHERE point_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO points_fts (point_id, content) VALUES (?, ?)")
                .bind(&id)
                .bind(&point.content)
                .execute(&mut *tx)
                .await?;
        }

        // A shorter re-ingestion leaves stale trailing ordinals behind;
        // drop them and their FTS shadow rows.
        sqlx::query(
            "DELETE FROM points_fts WHERE point_id IN \
             (SELECT id FROM points WHERE tenant = ? AND url = ? AND ordinal >= ?)",
        )
        .bind(tenant)
        .bind(url.as_str())
        .bind(points.len() as i64)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM points WHERE tenant = ? AND url = ? AND ordinal >= ?")
            .bind(tenant)
            .bind(url.as_str())
            .bind(points.len() as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(tenant, url = %url, points = points.len(), "indexed resource chunks");
        Ok(())
    }

    async fn hybrid_search(
        &self,
        tenant: &str,
        query: &str,
        vector: Option<&[f32]>,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let limit = limit.max(1);
        let take = limit * CANDIDATE_FACTOR;

        let dense_raw = match vector {
            Some(vector) if !vector.is_empty() => {
                self.dense_candidates(tenant, vector, filter, take).await?
            }
            _ => Vec::new(),
        };
        let sparse_raw = self.sparse_candidates(tenant, query, filter, take).await?;

        let dense_norm = normalize_channel(&dense_raw);
        let sparse_norm = normalize_channel(&sparse_raw);

        let mut candidate_ids: Vec<String> = Vec::new();
        let mut seen = FxHashSet::default();
        for (id, _) in dense_raw.iter().chain(sparse_raw.iter()) {
            if seen.insert(id.clone()) {
                candidate_ids.push(id.clone());
            }
        }

        let mut fused: Vec<(String, f64, f64, f64)> = candidate_ids
            .into_iter()
            .map(|id| {
                let dense = dense_norm.get(&id).copied();
                let sparse = sparse_norm.get(&id).copied();
                let score = fuse(self.alpha, dense, sparse);
                (id, score, dense.unwrap_or(0.0), sparse.unwrap_or(0.0))
            })
            .collect();
        fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        fused.truncate(limit);

        let ids: Vec<String> = fused.iter().map(|(id, ..)| id.clone()).collect();
        let mut rows = self.fetch_points(&ids).await?;

        let mut hits = Vec::with_capacity(fused.len());
        for (id, score, dense, sparse) in fused {
            let Some((url, kind, title, content)) = rows.remove(&id) else {
                continue;
            };
            hits.push(SearchHit {
                url,
                kind,
                title,
                content,
                additional: Additional {
                    score,
                    explain_score: format!(
                        "dense={dense:.4} sparse={sparse:.4} alpha={} fused={score:.4}",
                        self.alpha
                    ),
                },
            });
        }
        Ok(hits)
    }

    async fn count(&self, tenant: &str) -> Result<u64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM points WHERE tenant = ?")
            .bind(tenant)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }
}

/// Builds an FTS5 `MATCH` expression that ORs the query's terms, each
/// quoted so user text cannot inject match operators. Returns `None`
/// when no searchable term remains.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn push_url_filter(sql: &mut String, filter: Option<&SearchFilter>) {
    push_url_filter_aliased(sql, filter, "points");
}

fn push_url_filter_aliased(sql: &mut String, filter: Option<&SearchFilter>, alias: &str) {
    if let Some(filter) = filter
        && !filter.is_empty()
    {
        let placeholders = vec!["?"; filter.urls.len()].join(", ");
        sql.push_str(&format!(" AND {alias}.url IN ({placeholders})"));
    }
}

fn bind_url_filter<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: Option<&'q SearchFilter>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(filter) = filter {
        for url in &filter.urls {
            query = query.bind(url);
        }
    }
    query
}

fn normalize_channel(raw: &[(String, f64)]) -> FxHashMap<String, f64> {
    let scores: Vec<f64> = raw.iter().map(|(_, s)| *s).collect();
    let normalized = normalize_scores(&scores);
    raw.iter()
        .map(|(id, _)| id.clone())
        .zip(normalized)
        .collect()
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn test_index() -> SqliteVectorIndex {
        // In-memory databases exist per connection; keep a single one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteVectorIndex::new(pool, 0.5)
    }

    fn points_for(texts: &[(&str, Vec<f32>)]) -> Vec<ChunkPoint> {
        texts
            .iter()
            .map(|(content, vector)| {
                ChunkPoint::weblink("https://e.com/doc", "Doc", *content, vector.clone())
            })
            .collect()
    }

    #[tokio::test]
    async fn ensure_tenant_is_idempotent() {
        let index = test_index().await;
        assert_eq!(
            index.ensure_tenant("user-1").await.unwrap(),
            TenantState::Created
        );
        assert_eq!(
            index.ensure_tenant("user-1").await.unwrap(),
            TenantState::Existing
        );
    }

    #[tokio::test]
    async fn search_is_scoped_to_tenant() {
        let index = test_index().await;
        let url = Url::parse("https://e.com/doc").unwrap();
        index
            .upsert_chunks(
                "alice",
                &url,
                &points_for(&[("rust ownership rules", vec![1.0, 0.0])]),
            )
            .await
            .unwrap();
        index
            .upsert_chunks(
                "bob",
                &url,
                &points_for(&[("rust ownership rules", vec![1.0, 0.0])]),
            )
            .await
            .unwrap();

        let hits = index
            .hybrid_search("alice", "ownership", Some(&[1.0, 0.0]), None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(index.count("alice").await.unwrap(), 1);
        assert_eq!(index.count("carol").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reingestion_overwrites_instead_of_duplicating() {
        let index = test_index().await;
        let url = Url::parse("https://e.com/doc").unwrap();
        index
            .upsert_chunks("alice", &url, &points_for(&[("first draft", vec![1.0, 0.0])]))
            .await
            .unwrap();
        index
            .upsert_chunks(
                "alice",
                &url,
                &points_for(&[("second draft", vec![0.0, 1.0])]),
            )
            .await
            .unwrap();

        assert_eq!(index.count("alice").await.unwrap(), 1);
        let hits = index
            .hybrid_search("alice", "draft", None, None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "second draft");
    }

    #[tokio::test]
    async fn shrinking_reingestion_drops_stale_ordinals() {
        let index = test_index().await;
        let url = Url::parse("https://e.com/doc").unwrap();
        index
            .upsert_chunks(
                "alice",
                &url,
                &points_for(&[
                    ("part one", vec![1.0, 0.0]),
                    ("part two", vec![0.0, 1.0]),
                    ("part three", vec![0.5, 0.5]),
                ]),
            )
            .await
            .unwrap();
        index
            .upsert_chunks("alice", &url, &points_for(&[("only part", vec![1.0, 0.0])]))
            .await
            .unwrap();

        assert_eq!(index.count("alice").await.unwrap(), 1);
        let hits = index
            .hybrid_search("alice", "part", None, None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "only part");
    }

    #[tokio::test]
    async fn url_filter_restricts_results() {
        let index = test_index().await;
        let a = Url::parse("https://e.com/a").unwrap();
        let b = Url::parse("https://e.com/b").unwrap();
        let mut point_a = points_for(&[("shared topic text", vec![1.0, 0.0])]);
        point_a[0].url = a.to_string();
        let mut point_b = points_for(&[("shared topic text", vec![1.0, 0.0])]);
        point_b[0].url = b.to_string();
        index.upsert_chunks("alice", &a, &point_a).await.unwrap();
        index.upsert_chunks("alice", &b, &point_b).await.unwrap();

        let filter = SearchFilter::for_urls(["https://e.com/a"]);
        let hits = index
            .hybrid_search("alice", "shared topic", Some(&[1.0, 0.0]), Some(&filter), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://e.com/a");
    }

    #[tokio::test]
    async fn limit_caps_result_count() {
        let index = test_index().await;
        let url = Url::parse("https://e.com/doc").unwrap();
        let points: Vec<ChunkPoint> = (0..6)
            .map(|i| {
                ChunkPoint::weblink(
                    "https://e.com/doc",
                    "Doc",
                    format!("common theme segment {i}"),
                    vec![1.0, i as f32 / 10.0],
                )
            })
            .collect();
        index.upsert_chunks("alice", &url, &points).await.unwrap();

        let hits = index
            .hybrid_search("alice", "common theme", Some(&[1.0, 0.0]), None, 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn hits_carry_score_diagnostics() {
        let index = test_index().await;
        let url = Url::parse("https://e.com/doc").unwrap();
        index
            .upsert_chunks(
                "alice",
                &url,
                &points_for(&[("diagnostic payload", vec![1.0, 0.0])]),
            )
            .await
            .unwrap();

        let hits = index
            .hybrid_search("alice", "diagnostic", Some(&[1.0, 0.0]), None, 5)
            .await
            .unwrap();
        let explain = &hits[0].additional.explain_score;
        assert!(explain.contains("dense="));
        assert!(explain.contains("sparse="));
        assert!(explain.contains("alpha=0.5"));
    }

    #[test]
    fn match_expression_quotes_and_ors_terms() {
        assert_eq!(
            fts_match_expression("rust ownership").as_deref(),
            Some("\"rust\" OR \"ownership\"")
        );
        assert_eq!(
            fts_match_expression("(weird) \"input\"!").as_deref(),
            Some("\"weird\" OR \"input\"")
        );
        assert_eq!(fts_match_expression("  !!  "), None);
    }
}
