//! Metadata store: documents, chunks, and query history in SQLite.
//!
//! The store owns the authoritative document `status`. Every change goes
//! through [`MetadataStore::transition`], a conditional UPDATE that only
//! succeeds from an allowed predecessor state, so a redelivered event that
//! would move a document backwards is a no-op instead of a regression.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    ts_to_datetime, Document, DocumentChunk, DocumentStatus, ExtractedMetadata, QueryRecord,
    Source,
};

/// Fields supplied by the ingestion coordinator for a new upload.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub filename: String,
    pub mime_type: String,
    pub storage_key: String,
}

/// Result of replacing a document's chunk set.
#[derive(Debug, Default)]
pub struct ChunkSync {
    /// Vector ids whose rows no longer exist and must leave the vector index.
    pub removed_vector_ids: Vec<String>,
    /// Chunks whose content changed and now need embedding.
    pub changed: usize,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============ Documents ============

    pub async fn insert_document(&self, doc: &NewDocument) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, title, filename, mime_type, storage_key,
                                   status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(&doc.filename)
        .bind(&doc.mime_type)
        .bind(&doc.storage_key)
        .bind(DocumentStatus::Uploaded.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert document {}", doc.id))?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, title, filename, mime_type, storage_key, text_content,
                   metadata_json, status, external_search_id, external_vector_collection,
                   created_at, updated_at
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    /// Move a document to `next` if its current status allows it.
    /// Returns `false` when the transition was rejected.
    pub async fn transition(&self, id: &str, next: DocumentStatus) -> Result<bool> {
        self.transition_from(id, next, &next.predecessors()).await
    }

    /// Move a document to `next` only if its status is one of `allowed`.
    pub async fn transition_from(
        &self,
        id: &str,
        next: DocumentStatus,
        allowed: &[DocumentStatus],
    ) -> Result<bool> {
        if allowed.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; allowed.len()].join(", ");
        let sql = format!(
            "UPDATE documents SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(Utc::now().timestamp())
            .bind(id);
        for st in allowed {
            query = query.bind(st.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator reset of a terminal document back to `uploaded`.
    pub async fn reset_for_reprocess(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'uploaded', updated_at = ?
             WHERE id = ? AND status IN ('failed', 'indexed')",
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn save_extraction(
        &self,
        id: &str,
        text: &str,
        metadata: &ExtractedMetadata,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET text_content = ?, metadata_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(text)
        .bind(serde_json::to_string(metadata)?)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_external_ids(
        &self,
        id: &str,
        search_id: Option<&str>,
        vector_collection: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents SET
                external_search_id = COALESCE(?, external_search_id),
                external_vector_collection = COALESCE(?, external_vector_collection),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(search_id)
        .bind(vector_collection)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the document row; chunk rows go with it (ON DELETE CASCADE).
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Titles of `owner_id`'s `indexed` documents, keyed by id. These are
    /// the only documents semantic retrieval may draw from.
    pub async fn indexed_documents(&self, owner_id: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT id, title FROM documents WHERE owner_id = ? AND status = 'indexed'",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("title")))
            .collect())
    }

    // ============ Chunks ============

    /// Upsert `chunks` keyed on `(document_id, chunk_index)`.
    ///
    /// An unchanged chunk keeps its `vector_id`; a changed one has it
    /// cleared. Rows past the new chunk count are removed.
    pub async fn sync_chunks(
        &self,
        document_id: &str,
        chunks: &[DocumentChunk],
    ) -> Result<ChunkSync> {
        let mut tx = self.pool.begin().await?;
        let mut sync = ChunkSync::default();

        for chunk in chunks {
            let result = sqlx::query(
                r#"
                INSERT INTO document_chunks (id, document_id, chunk_index, content, content_hash, vector_id)
                VALUES (?, ?, ?, ?, ?, NULL)
                ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    vector_id = NULL
                WHERE document_chunks.content_hash != excluded.content_hash
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .execute(&mut *tx)
            .await?;
            sync.changed += result.rows_affected() as usize;
        }

        let stale = sqlx::query(
            "SELECT vector_id FROM document_chunks WHERE document_id = ? AND chunk_index >= ?",
        )
        .bind(document_id)
        .bind(chunks.len() as i64)
        .fetch_all(&mut *tx)
        .await?;
        sync.removed_vector_ids = stale
            .iter()
            .filter_map(|r| r.get::<Option<String>, _>("vector_id"))
            .collect();

        sqlx::query("DELETE FROM document_chunks WHERE document_id = ? AND chunk_index >= ?")
            .bind(document_id)
            .bind(chunks.len() as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(sync)
    }

    pub async fn chunks(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, content_hash, vector_id
             FROM document_chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Chunks still lacking a vector, in index order.
    pub async fn unembedded_chunks(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, content_hash, vector_id
             FROM document_chunks WHERE document_id = ? AND vector_id IS NULL
             ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Record `(chunk_id, vector_id)` pairs after their vectors are written.
    pub async fn mark_embedded(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (chunk_id, vector_id) in pairs {
            sqlx::query("UPDATE document_chunks SET vector_id = ? WHERE id = ?")
                .bind(vector_id)
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ============ Query history ============

    pub async fn insert_query(&self, record: &QueryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queries (id, user_id, query, answer, intent, entities_json,
                                 sources_json, grounded, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.query)
        .bind(&record.answer)
        .bind(&record.intent)
        .bind(serde_json::to_string(&record.entities)?)
        .bind(serde_json::to_string(&record.sources)?)
        .bind(record.grounded)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent queries first.
    pub async fn query_history(&self, user_id: &str, limit: i64) -> Result<Vec<QueryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, query, answer, intent, entities_json, sources_json, grounded, created_at
            FROM queries WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let entities_json: String = row.get("entities_json");
                let sources_json: String = row.get("sources_json");
                let entities: Vec<String> = serde_json::from_str(&entities_json)?;
                let sources: Vec<Source> = serde_json::from_str(&sources_json)?;
                Ok(QueryRecord {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    query: row.get("query"),
                    answer: row.get("answer"),
                    intent: row.get("intent"),
                    entities,
                    sources,
                    grounded: row.get("grounded"),
                    created_at: ts_to_datetime(row.get("created_at")),
                })
            })
            .collect()
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let metadata_json: String = row.get("metadata_json");
    // '{}' until extraction has run.
    let metadata = serde_json::from_str::<ExtractedMetadata>(&metadata_json).ok();

    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        filename: row.get("filename"),
        mime_type: row.get("mime_type"),
        storage_key: row.get("storage_key"),
        text_content: row.get("text_content"),
        metadata,
        status: DocumentStatus::parse(&status)
            .with_context(|| format!("unknown document status '{}'", status))?,
        external_search_id: row.get("external_search_id"),
        external_vector_collection: row.get("external_vector_collection"),
        created_at: ts_to_datetime(row.get("created_at")),
        updated_at: ts_to_datetime(row.get("updated_at")),
    })
}

fn chunk_from_row(row: &SqliteRow) -> DocumentChunk {
    DocumentChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        vector_id: row.get("vector_id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, vector_id};
    use crate::config::Config;
    use tempfile::TempDir;

    async fn store() -> (TempDir, MetadataStore) {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_data_dir(tmp.path());
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, MetadataStore::new(pool))
    }

    fn new_doc(id: &str) -> NewDocument {
        NewDocument {
            id: id.into(),
            owner_id: "u1".into(),
            title: "Notes".into(),
            filename: "notes.txt".into(),
            mime_type: "text/plain".into(),
            storage_key: format!("k_{}", id),
        }
    }

    #[tokio::test]
    async fn transitions_are_monotonic() {
        let (_tmp, store) = store().await;
        store.insert_document(&new_doc("d1")).await.unwrap();

        assert!(store.transition("d1", DocumentStatus::Extracting).await.unwrap());
        assert!(!store.transition("d1", DocumentStatus::Downloading).await.unwrap());
        assert!(store.transition("d1", DocumentStatus::Indexed).await.unwrap());
        assert!(!store.transition("d1", DocumentStatus::Failed).await.unwrap());

        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);

        assert!(store.reset_for_reprocess("d1").await.unwrap());
        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Uploaded);
    }

    #[tokio::test]
    async fn transition_from_restarts_within_allowed_set() {
        let (_tmp, store) = store().await;
        store.insert_document(&new_doc("d1")).await.unwrap();
        store.transition("d1", DocumentStatus::Analyzing).await.unwrap();

        let from = [DocumentStatus::Extracting, DocumentStatus::Analyzing];
        assert!(store
            .transition_from("d1", DocumentStatus::Downloading, &from)
            .await
            .unwrap());
        assert_eq!(
            store.get_document("d1").await.unwrap().unwrap().status,
            DocumentStatus::Downloading
        );

        // Outside the set, nothing moves.
        assert!(!store
            .transition_from("d1", DocumentStatus::Downloading, &from)
            .await
            .unwrap());
        assert!(!store
            .transition_from("d1", DocumentStatus::Downloading, &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sync_keeps_vectors_of_unchanged_chunks() {
        let (_tmp, store) = store().await;
        store.insert_document(&new_doc("d1")).await.unwrap();

        let first = chunk_text("d1", &"a".repeat(30), 10);
        let sync = store.sync_chunks("d1", &first).await.unwrap();
        assert_eq!(sync.changed, 3);
        let pairs: Vec<_> = first
            .iter()
            .map(|c| (c.id.clone(), vector_id("d1", c.chunk_index)))
            .collect();
        store.mark_embedded(&pairs).await.unwrap();

        // Same first window, different second, and one fewer window.
        let text = format!("{}{}", "a".repeat(10), "b".repeat(10));
        let second = chunk_text("d1", &text, 10);
        let sync = store.sync_chunks("d1", &second).await.unwrap();
        assert_eq!(sync.changed, 1);
        assert_eq!(sync.removed_vector_ids, vec!["d1:2".to_string()]);

        let rows = store.chunks("d1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].vector_id.as_deref(), Some("d1:0"));
        assert_eq!(rows[1].vector_id, None);
        assert_eq!(rows[0].id, first[0].id);

        let pending = store.unembedded_chunks("d1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chunk_index, 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let (_tmp, store) = store().await;
        store.insert_document(&new_doc("d1")).await.unwrap();
        store
            .sync_chunks("d1", &chunk_text("d1", "hello world", 5))
            .await
            .unwrap();

        assert!(store.delete_document("d1").await.unwrap());
        assert!(store.get_document("d1").await.unwrap().is_none());
        assert!(store.chunks("d1").await.unwrap().is_empty());
        assert!(!store.delete_document("d1").await.unwrap());
    }

    #[tokio::test]
    async fn indexed_documents_scoped_to_owner_and_status() {
        let (_tmp, store) = store().await;
        store.insert_document(&new_doc("d1")).await.unwrap();
        store.insert_document(&new_doc("d2")).await.unwrap();
        store.transition("d1", DocumentStatus::Indexed).await.unwrap();

        let indexed = store.indexed_documents("u1").await.unwrap();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed.get("d1").map(String::as_str), Some("Notes"));
        assert!(store.indexed_documents("u2").await.unwrap().is_empty());
    }
}
