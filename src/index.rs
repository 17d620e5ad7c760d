//! Full-text and vector indexes.
//!
//! Both indexes are multi-tenant and every read carries an owner scope:
//! full-text queries filter on `owner_id`, and vectors live in one
//! collection per owner (see [`collection_for`]). Writes are keyed by
//! deterministic ids (document id, `"{documentId}:{chunkIndex}"`) so
//! re-indexing overwrites instead of duplicating.
//!
//! [`DualIndexer`] is the single entry point the pipeline and the delete
//! path use, so both indexes are always updated together.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

/// Vector collection holding `owner_id`'s chunks.
pub fn collection_for(owner_id: &str) -> String {
    format!("owner_{}", owner_id)
}

// ============ Full-text ============

#[derive(Debug, Clone)]
pub struct FullTextDoc {
    pub document_id: String,
    pub owner_id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document_id: String,
    pub title: String,
    pub snippet: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total: i64,
}

#[async_trait]
pub trait FullTextIndex: Send + Sync {
    /// Insert or replace the entry for `doc.document_id`.
    async fn upsert(&self, doc: &FullTextDoc) -> Result<()>;
    async fn search(&self, owner_id: &str, query: &str, offset: i64, limit: i64)
        -> Result<SearchPage>;
    async fn delete(&self, document_id: &str) -> Result<()>;
}

/// Turn free text into an FTS5 expression: every alphanumeric term quoted,
/// all terms required. `None` when nothing searchable remains.
pub fn fts_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

pub struct SqliteFullTextIndex {
    pool: SqlitePool,
}

impl SqliteFullTextIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FullTextIndex for SqliteFullTextIndex {
    async fn upsert(&self, doc: &FullTextDoc) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fulltext WHERE document_id = ?")
            .bind(&doc.document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO fulltext (document_id, owner_id, title, content) VALUES (?, ?, ?, ?)",
        )
        .bind(&doc.document_id)
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(&doc.content)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to index document {}", doc.document_id))?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        owner_id: &str,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> Result<SearchPage> {
        let Some(expr) = fts_query(query) else {
            return Ok(SearchPage::default());
        };

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fulltext WHERE fulltext MATCH ? AND owner_id = ?",
        )
        .bind(&expr)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT document_id, title, bm25(fulltext) AS rank,
                   snippet(fulltext, 3, '>>>', '<<<', '...', 24) AS snippet
            FROM fulltext
            WHERE fulltext MATCH ? AND owner_id = ?
            ORDER BY rank
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&expr)
        .bind(owner_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchHit {
                    document_id: row.get("document_id"),
                    title: row.get("title"),
                    snippet: row.get("snippet"),
                    score: -rank, // negate so higher = better
                }
            })
            .collect();

        Ok(SearchPage { hits, total })
    }

    async fn delete(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM fulltext WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============ Vectors ============

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub vector_id: String,
    pub document_id: String,
    pub owner_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub vector_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;
    /// Nearest `top_k` vectors in `collection` by cosine similarity. With
    /// `eligible`, only vectors of those documents compete for the `top_k`.
    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        eligible: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>>;
    /// Remove every vector whose payload references `document_id`.
    async fn delete_document(&self, document_id: &str) -> Result<()>;
    async fn delete_ids(&self, vector_ids: &[String]) -> Result<()>;
}

/// Vectors stored as little-endian f32 BLOBs; similarity computed in Rust
/// over the collection.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO vectors (vector_id, collection, document_id, owner_id, chunk_index,
                                     content, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(vector_id) DO UPDATE SET
                    collection = excluded.collection,
                    content = excluded.content,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&r.vector_id)
            .bind(collection)
            .bind(&r.document_id)
            .bind(&r.owner_id)
            .bind(r.chunk_index)
            .bind(&r.content)
            .bind(r.embedding.len() as i64)
            .bind(vec_to_blob(&r.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        eligible: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query(
            "SELECT vector_id, document_id, chunk_index, content, embedding
             FROM vectors WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .filter(|row| match eligible {
                Some(ids) => ids.contains(&row.get::<String, _>("document_id")),
                None => true,
            })
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                VectorHit {
                    vector_id: row.get("vector_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    score: cosine_similarity(embedding, &blob_to_vec(&blob)),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_ids(&self, vector_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in vector_ids {
            sqlx::query("DELETE FROM vectors WHERE vector_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ============ Dual indexer ============

#[derive(Clone)]
pub struct DualIndexer {
    pub fulltext: Arc<dyn FullTextIndex>,
    pub vectors: Arc<dyn VectorIndex>,
}

impl DualIndexer {
    pub fn new(fulltext: Arc<dyn FullTextIndex>, vectors: Arc<dyn VectorIndex>) -> Self {
        Self { fulltext, vectors }
    }

    /// Upsert the keyword-search entry. Returns the full-text id.
    pub async fn index_text(
        &self,
        document_id: &str,
        owner_id: &str,
        title: &str,
        text: &str,
    ) -> Result<String> {
        self.fulltext
            .upsert(&FullTextDoc {
                document_id: document_id.to_string(),
                owner_id: owner_id.to_string(),
                title: title.to_string(),
                content: text.to_string(),
            })
            .await?;
        Ok(document_id.to_string())
    }

    pub async fn index_vectors(&self, owner_id: &str, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.vectors.upsert(&collection_for(owner_id), records).await
    }

    /// Remove the full-text entry and every vector of `document_id`.
    pub async fn delete(&self, document_id: &str) -> Result<()> {
        self.fulltext
            .delete(document_id)
            .await
            .context("failed to delete full-text entry")?;
        self.vectors
            .delete_document(document_id)
            .await
            .context("failed to delete vectors")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_data_dir(tmp.path());
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, pool)
    }

    fn doc(id: &str, owner: &str, content: &str) -> FullTextDoc {
        FullTextDoc {
            document_id: id.into(),
            owner_id: owner.into(),
            title: format!("title {}", id),
            content: content.into(),
        }
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(
            fts_query("capital of France?").as_deref(),
            Some("\"capital\" \"of\" \"France\"")
        );
        assert_eq!(fts_query("?!  "), None);
    }

    #[tokio::test]
    async fn fulltext_is_owner_scoped_and_upserts() {
        let (_tmp, pool) = pool().await;
        let idx = SqliteFullTextIndex::new(pool);
        idx.upsert(&doc("a", "1", "The capital of France is Paris."))
            .await
            .unwrap();
        idx.upsert(&doc("b", "2", "The capital of France is Paris."))
            .await
            .unwrap();
        // Re-index replaces.
        idx.upsert(&doc("a", "1", "Paris, again.")).await.unwrap();

        let page = idx.search("1", "Paris", 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].document_id, "a");
        assert!(page.hits[0].snippet.contains(">>>Paris<<<"));

        idx.delete("a").await.unwrap();
        assert_eq!(idx.search("1", "Paris", 0, 10).await.unwrap().total, 0);
        assert_eq!(idx.search("2", "Paris", 0, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn fulltext_pages() {
        let (_tmp, pool) = pool().await;
        let idx = SqliteFullTextIndex::new(pool);
        for i in 0..5 {
            idx.upsert(&doc(&format!("d{}", i), "1", "shared keyword"))
                .await
                .unwrap();
        }
        let page = idx.search("1", "keyword", 2, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.hits.len(), 2);
    }

    #[tokio::test]
    async fn vectors_rank_by_cosine_within_collection() {
        let (_tmp, pool) = pool().await;
        let idx = SqliteVectorIndex::new(pool);
        let rec = |id: &str, doc: &str, v: Vec<f32>| VectorRecord {
            vector_id: id.into(),
            document_id: doc.into(),
            owner_id: "1".into(),
            chunk_index: 0,
            content: id.into(),
            embedding: v,
        };
        idx.upsert(
            "owner_1",
            &[rec("a:0", "a", vec![1.0, 0.0]), rec("b:0", "b", vec![0.6, 0.8])],
        )
        .await
        .unwrap();
        idx.upsert("owner_2", &[rec("c:0", "c", vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = idx.query("owner_1", &[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].vector_id, "a:0");
        assert!(hits[0].score > hits[1].score);

        // Overwrite is idempotent.
        idx.upsert("owner_1", &[rec("a:0", "a", vec![0.0, 1.0])])
            .await
            .unwrap();
        let hits = idx.query("owner_1", &[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].vector_id, "b:0");

        idx.delete_document("b").await.unwrap();
        assert_eq!(idx.query("owner_1", &[1.0, 0.0], 5, None).await.unwrap().len(), 1);
        assert!(idx.query("owner_9", &[1.0, 0.0], 5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vectors_filter_before_top_k() {
        let (_tmp, pool) = pool().await;
        let idx = SqliteVectorIndex::new(pool);
        let rec = |id: &str, doc: &str, v: Vec<f32>| VectorRecord {
            vector_id: id.into(),
            document_id: doc.into(),
            owner_id: "1".into(),
            chunk_index: 0,
            content: id.into(),
            embedding: v,
        };
        idx.upsert(
            "owner_1",
            &[rec("near:0", "near", vec![1.0, 0.0]), rec("far:0", "far", vec![0.6, 0.8])],
        )
        .await
        .unwrap();

        let eligible: HashSet<String> = ["far".to_string()].into();
        let hits = idx
            .query("owner_1", &[1.0, 0.0], 1, Some(&eligible))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "far");

        let none = HashSet::new();
        assert!(idx
            .query("owner_1", &[1.0, 0.0], 1, Some(&none))
            .await
            .unwrap()
            .is_empty());
    }
}
