//! Extraction stage: `DocumentUploaded` → text + metadata →
//! `DocumentProcessed`.

use async_trait::async_trait;
use chrono::Utc;

use crate::bus::ConsumerGroup;
use crate::error::{with_timeout, Error, Result};
use crate::events::{DocumentProcessed, Event};
use crate::models::DocumentStatus;
use crate::services::Services;
use crate::stages::{advance, fail_document, note_retry, resume};
use crate::worker::StageHandler;

/// Statuses extraction restarts from: its own steps and the one before.
const RESTARTABLE_FROM: [DocumentStatus; 4] = [
    DocumentStatus::Uploaded,
    DocumentStatus::Downloading,
    DocumentStatus::Extracting,
    DocumentStatus::Analyzing,
];

pub struct ExtractionStage {
    svc: Services,
}

impl ExtractionStage {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl StageHandler for ExtractionStage {
    fn group(&self) -> ConsumerGroup {
        ConsumerGroup::Extraction
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Event::DocumentUploaded(uploaded) = event else {
            return Ok(());
        };
        let id = uploaded.document_id.as_str();
        let svc = &self.svc;
        let limit = svc.config.pipeline.call_timeout();

        let doc = svc
            .metadata
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))?;
        if doc.status.is_past(DocumentStatus::Analyzing) {
            tracing::debug!(status = %doc.status, "already extracted; skipping");
            return Ok(());
        }

        if !resume(svc, id, DocumentStatus::Downloading, 10, &RESTARTABLE_FROM).await? {
            return Ok(());
        }
        let bytes = with_timeout(limit, "blob download", async {
            svc.blobs
                .get(&uploaded.storage_key)
                .await
                .map_err(Error::from)
        })
        .await?;

        if !advance(svc, id, DocumentStatus::Extracting, 30).await? {
            return Ok(());
        }
        let extraction = with_timeout(
            limit,
            "text extraction",
            svc.extractor.extract(bytes, &uploaded.mime_type, &doc.title),
        )
        .await?;

        if !advance(svc, id, DocumentStatus::Analyzing, 50).await? {
            return Ok(());
        }
        svc.metadata
            .save_extraction(id, &extraction.text, &extraction.metadata)
            .await?;

        tracing::info!(
            chars = extraction.text.chars().count(),
            pages = extraction.metadata.page_count,
            words = extraction.metadata.word_count,
            language = %extraction.metadata.language,
            "text extracted"
        );

        svc.bus
            .publish(&Event::DocumentProcessed(DocumentProcessed {
                document_id: id.to_string(),
                owner_id: uploaded.owner_id.clone(),
                success: true,
                text_content: Some(extraction.text),
                metadata: Some(extraction.metadata),
                error: None,
                timestamp: Utc::now(),
            }))
            .await?;
        Ok(())
    }

    async fn on_retry(&self, event: &Event, err: &Error) {
        if let Err(e) = note_retry(&self.svc, event.document_id(), err).await {
            tracing::warn!(error = %e, "failed to note retry on status");
        }
    }

    async fn on_failure(&self, event: &Event, err: &Error) -> Result<()> {
        if !fail_document(&self.svc, event.document_id(), err).await? {
            return Ok(());
        }
        self.svc
            .bus
            .publish(&Event::DocumentProcessed(DocumentProcessed {
                document_id: event.document_id().to_string(),
                owner_id: event.owner_id().to_string(),
                success: false,
                text_content: None,
                metadata: None,
                error: Some(format!("{}: {}", err.kind(), err.message())),
                timestamp: Utc::now(),
            }))
            .await?;
        Ok(())
    }
}
