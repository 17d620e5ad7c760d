//! Chunking & embedding stage: `DocumentProcessed{success}` → chunks →
//! full-text entry → vectors → `indexed`.
//!
//! Chunk rows are synced rather than replaced, so a redelivery after a
//! partial failure only embeds the chunks still missing a vector.

use async_trait::async_trait;
use chrono::Utc;

use crate::bus::ConsumerGroup;
use crate::chunk::{chunk_text, vector_id};
use crate::error::{with_timeout, Error, Result};
use crate::events::{DocumentEmbedded, DocumentIndexed, Event};
use crate::index::{collection_for, VectorRecord};
use crate::models::DocumentStatus;
use crate::services::Services;
use crate::stages::{advance, fail_document, note_retry, still_present};
use crate::worker::StageHandler;

const EMBED_PROGRESS_START: u8 = 60;
const EMBED_PROGRESS_END: u8 = 95;

pub struct EmbeddingStage {
    svc: Services,
}

impl EmbeddingStage {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }
}

/// Progress after `done` of `total` batches.
fn batch_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return EMBED_PROGRESS_END;
    }
    let span = (EMBED_PROGRESS_END - EMBED_PROGRESS_START) as usize;
    EMBED_PROGRESS_START + (span * done.min(total) / total) as u8
}

#[async_trait]
impl StageHandler for EmbeddingStage {
    fn group(&self) -> ConsumerGroup {
        ConsumerGroup::Embedding
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::DocumentProcessed(processed) = event else {
            return Ok(());
        };
        if !processed.success {
            return Ok(());
        }
        let id = processed.document_id.as_str();
        let svc = &self.svc;
        let limit = svc.config.pipeline.call_timeout();

        let doc = svc
            .metadata
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))?;
        if doc.status.is_past(DocumentStatus::Embedding) {
            tracing::debug!(status = %doc.status, "already embedded; skipping");
            return Ok(());
        }
        let text = doc
            .text_content
            .clone()
            .or_else(|| processed.text_content.clone())
            .ok_or_else(|| Error::Validation(format!("document {} has no extracted text", id)))?;

        if !advance(svc, id, DocumentStatus::Embedding, EMBED_PROGRESS_START).await? {
            return Ok(());
        }

        // Chunk rows first; stale vectors of chunks that no longer exist go.
        let chunks = chunk_text(id, &text, svc.config.chunking.window_chars);
        let sync = svc.metadata.sync_chunks(id, &chunks).await?;
        if !sync.removed_vector_ids.is_empty() {
            with_timeout(limit, "vector delete", async {
                svc.indexer
                    .vectors
                    .delete_ids(&sync.removed_vector_ids)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        }

        // Full text before vectors: keyword search works even if embedding fails.
        let search_id = with_timeout(limit, "full-text index", async {
            svc.indexer
                .index_text(id, &doc.owner_id, &doc.title, &text)
                .await
                .map_err(Error::from)
        })
        .await?;
        if !still_present(svc, id).await? {
            return Ok(());
        }
        let collection = collection_for(&doc.owner_id);
        svc.metadata
            .set_external_ids(id, Some(&search_id), Some(&collection))
            .await?;
        svc.bus
            .publish(&Event::DocumentIndexed(DocumentIndexed {
                document_id: id.to_string(),
                owner_id: doc.owner_id.clone(),
                search_id,
                timestamp: Utc::now(),
            }))
            .await?;

        let pending = svc.metadata.unembedded_chunks(id).await?;
        let batch_size = svc.config.embedding.batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        tracing::info!(
            chunks = chunks.len(),
            pending = pending.len(),
            changed = sync.changed,
            batches = total_batches,
            "embedding chunks"
        );

        for (i, batch) in pending.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = with_timeout(limit, "embedding request", async {
                svc.embedder.embed(&texts).await.map_err(Error::from)
            })
            .await?;
            if vectors.len() != batch.len() {
                return Err(Error::Dependency(anyhow::anyhow!(
                    "embedding provider returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, embedding)| VectorRecord {
                    vector_id: vector_id(id, chunk.chunk_index),
                    document_id: id.to_string(),
                    owner_id: doc.owner_id.clone(),
                    chunk_index: chunk.chunk_index,
                    content: chunk.content.clone(),
                    embedding,
                })
                .collect();
            with_timeout(limit, "vector upsert", async {
                svc.indexer
                    .index_vectors(&doc.owner_id, &records)
                    .await
                    .map_err(Error::from)
            })
            .await?;
            if !still_present(svc, id).await? {
                return Ok(());
            }

            let pairs: Vec<(String, String)> = batch
                .iter()
                .zip(&records)
                .map(|(chunk, record)| (chunk.id.clone(), record.vector_id.clone()))
                .collect();
            svc.metadata.mark_embedded(&pairs).await?;
            svc.status
                .record(
                    id,
                    DocumentStatus::Embedding,
                    batch_progress(i + 1, total_batches),
                    None,
                    None,
                )
                .await?;
        }

        svc.bus
            .publish(&Event::DocumentEmbedded(DocumentEmbedded {
                document_id: id.to_string(),
                owner_id: doc.owner_id.clone(),
                chunk_count: chunks.len(),
                collection,
                timestamp: Utc::now(),
            }))
            .await?;
        if advance(svc, id, DocumentStatus::Indexed, 100).await? {
            tracing::info!(chunks = chunks.len(), "document indexed");
        }
        Ok(())
    }

    async fn on_retry(&self, event: &Event, err: &Error) {
        if let Err(e) = note_retry(&self.svc, event.document_id(), err).await {
            tracing::warn!(error = %e, "failed to note retry on status");
        }
    }

    async fn on_failure(&self, event: &Event, err: &Error) -> Result<()> {
        fail_document(&self.svc, event.document_id(), err).await?;
        Ok(())
    }
}
