//! Ingestion coordinator.
//!
//! Accepts uploads, deletes, and operator reprocessing requests. An upload
//! stores the blob, inserts the document row, and publishes
//! `DocumentUploaded`, then returns; extraction and indexing happen in the
//! stage workers. The row is always written before the event so a consumer
//! that races ahead can resolve the document.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::blob::storage_key;
use crate::error::{with_timeout, Error, Result};
use crate::events::{DocumentDeleted, DocumentUploaded, Event};
use crate::metadata::NewDocument;
use crate::models::{Document, DocumentStatus, StatusSnapshot};
use crate::services::Services;

/// A new upload as received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub owner_id: String,
    pub title: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// A document as returned to clients: the stored row plus a direct
/// download link when the blob backend can presign one.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

#[derive(Clone)]
pub struct Coordinator {
    svc: Services,
}

impl Coordinator {
    pub fn new(svc: Services) -> Self {
        Self { svc }
    }

    pub async fn upload(&self, upload: Upload) -> Result<String> {
        let owner_id = upload.owner_id.trim();
        let filename = upload.filename.trim();
        let mime_type = upload.mime_type.trim();
        if owner_id.is_empty() {
            return Err(Error::Validation("ownerId is required".into()));
        }
        if filename.is_empty() {
            return Err(Error::Validation("filename is required".into()));
        }
        if mime_type.is_empty() {
            return Err(Error::Validation("mimeType is required".into()));
        }
        if upload.content.is_empty() {
            return Err(Error::Validation("file content is empty".into()));
        }
        let max = self.svc.config.server.max_upload_bytes;
        if upload.content.len() > max {
            return Err(Error::Validation(format!(
                "file is {} bytes; the limit is {}",
                upload.content.len(),
                max
            )));
        }

        let id = Uuid::new_v4().to_string();
        let key = storage_key(&id, filename);
        let title = upload
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(filename)
            .to_string();

        with_timeout(self.svc.config.pipeline.call_timeout(), "blob upload", async {
            self.svc
                .blobs
                .put(&key, &upload.content, mime_type)
                .await
                .map_err(Error::from)
        })
        .await?;

        let new_doc = NewDocument {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            title,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            storage_key: key.clone(),
        };
        if let Err(e) = self.svc.metadata.insert_document(&new_doc).await {
            if let Err(cleanup) = self.svc.blobs.delete(&key).await {
                tracing::warn!(document_id = %id, error = %cleanup, "failed to remove orphaned blob");
            }
            return Err(e.into());
        }
        self.svc
            .status
            .record(&id, DocumentStatus::Uploaded, 0, None, None)
            .await?;

        let event = Event::DocumentUploaded(DocumentUploaded {
            document_id: id.clone(),
            owner_id: new_doc.owner_id.clone(),
            filename: new_doc.filename.clone(),
            mime_type: new_doc.mime_type.clone(),
            storage_key: key,
            timestamp: Utc::now(),
        });
        if let Err(e) = self.svc.bus.publish(&event).await {
            // Leave the document reprocessable instead of stuck in `uploaded`.
            let err = Error::from(e);
            crate::stages::fail_document(&self.svc, &id, &err).await?;
            return Err(err);
        }

        tracing::info!(
            document_id = %id,
            owner_id = %new_doc.owner_id,
            mime_type = %new_doc.mime_type,
            bytes = upload.content.len(),
            "document uploaded"
        );
        Ok(id)
    }

    /// Remove a document from both indexes, the metadata store, and blob
    /// storage, in that order.
    ///
    /// The indexes are swept again once the row is gone, so entries an
    /// in-flight embedding stage wrote in between do not outlive it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let doc = self.require(id).await?;
        let limit = self.svc.config.pipeline.call_timeout();

        with_timeout(limit, "index delete", async {
            self.svc.indexer.delete(id).await.map_err(Error::from)
        })
        .await?;
        self.svc.metadata.delete_document(id).await?;
        with_timeout(limit, "index delete", async {
            self.svc.indexer.delete(id).await.map_err(Error::from)
        })
        .await?;
        self.svc.status.remove(id).await?;
        with_timeout(limit, "blob delete", async {
            self.svc
                .blobs
                .delete(&doc.storage_key)
                .await
                .map_err(Error::from)
        })
        .await?;

        let event = Event::DocumentDeleted(DocumentDeleted {
            document_id: id.to_string(),
            owner_id: doc.owner_id.clone(),
            timestamp: Utc::now(),
        });
        if let Err(e) = self.svc.bus.publish(&event).await {
            tracing::warn!(document_id = %id, error = %e, "failed to publish DocumentDeleted");
        }
        tracing::info!(document_id = %id, "document deleted");
        Ok(())
    }

    /// Reset a `failed` or `indexed` document to `uploaded` and run it
    /// through the pipeline again.
    pub async fn reprocess(&self, id: &str) -> Result<()> {
        let doc = self.require(id).await?;
        if !self.svc.metadata.reset_for_reprocess(id).await? {
            return Err(Error::Validation(format!(
                "document {} is {}; only failed or indexed documents can be reprocessed",
                id, doc.status
            )));
        }
        self.svc
            .status
            .record(id, DocumentStatus::Uploaded, 0, None, None)
            .await?;
        self.svc
            .bus
            .publish(&Event::DocumentUploaded(DocumentUploaded {
                document_id: doc.id.clone(),
                owner_id: doc.owner_id.clone(),
                filename: doc.filename.clone(),
                mime_type: doc.mime_type.clone(),
                storage_key: doc.storage_key.clone(),
                timestamp: Utc::now(),
            }))
            .await?;
        tracing::info!(document_id = %id, previous = %doc.status, "document requeued");
        Ok(())
    }

    pub async fn document(&self, id: &str) -> Result<DocumentView> {
        let document = self.require(id).await?;
        let download_url = self.svc.blobs.presigned_read_url(&document.storage_key)?;
        Ok(DocumentView {
            document,
            download_url,
        })
    }

    pub async fn download(&self, id: &str) -> Result<Download> {
        let doc = self.require(id).await?;
        let bytes = with_timeout(self.svc.config.pipeline.call_timeout(), "blob download", async {
            self.svc
                .blobs
                .get(&doc.storage_key)
                .await
                .map_err(Error::from)
        })
        .await?;
        Ok(Download {
            bytes,
            mime_type: doc.mime_type,
            filename: doc.filename,
        })
    }

    pub async fn status(&self, id: &str) -> Result<StatusSnapshot> {
        self.svc
            .status
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no status recorded for document {}", id)))
    }

    async fn require(&self, id: &str) -> Result<Document> {
        self.svc
            .metadata
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ConsumerGroup;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn coordinator() -> (TempDir, Services, Coordinator) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_data_dir(tmp.path());
        config.server.max_upload_bytes = 64;
        let svc = Services::from_config(config).await.unwrap();
        (tmp, svc.clone(), Coordinator::new(svc))
    }

    fn upload(owner: &str, content: &[u8]) -> Upload {
        Upload {
            owner_id: owner.into(),
            title: None,
            filename: "notes.txt".into(),
            mime_type: "text/plain".into(),
            content: content.to_vec(),
        }
    }

    #[tokio::test]
    async fn upload_records_row_status_and_event() {
        let (_tmp, svc, coord) = coordinator().await;
        let id = coord.upload(upload("1", b"hello")).await.unwrap();

        let doc = svc.metadata.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Uploaded);
        assert_eq!(doc.title, "notes.txt");
        assert!(doc.storage_key.ends_with("_notes.txt"));
        assert_eq!(svc.blobs.get(&doc.storage_key).await.unwrap(), b"hello");

        let status = coord.status(&id).await.unwrap();
        assert_eq!(status.stage, DocumentStatus::Uploaded);
        assert_eq!(status.progress, 0);

        assert_eq!(svc.bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 1);
        assert_eq!(svc.bus.outstanding(ConsumerGroup::Embedding).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upload_validates_input() {
        let (_tmp, _svc, coord) = coordinator().await;
        for bad in [
            upload("", b"x"),
            upload("1", b""),
            upload("1", &[b'a'; 65]),
            Upload {
                mime_type: " ".into(),
                ..upload("1", b"x")
            },
        ] {
            let err = coord.upload(bad).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let (_tmp, _svc, coord) = coordinator().await;
        assert!(matches!(coord.delete("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(coord.document("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(coord.status("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(coord.reprocess("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn reprocess_requires_terminal_state() {
        let (_tmp, svc, coord) = coordinator().await;
        let id = coord.upload(upload("1", b"hello")).await.unwrap();
        assert!(matches!(coord.reprocess(&id).await, Err(Error::Validation(_))));

        svc.metadata
            .transition(&id, DocumentStatus::Failed)
            .await
            .unwrap();
        coord.reprocess(&id).await.unwrap();
        let doc = svc.metadata.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Uploaded);
        assert_eq!(svc.bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_removes_row_status_and_blob() {
        let (_tmp, svc, coord) = coordinator().await;
        let id = coord.upload(upload("1", b"hello")).await.unwrap();
        let key = svc.metadata.get_document(&id).await.unwrap().unwrap().storage_key;

        coord.delete(&id).await.unwrap();
        assert!(svc.metadata.get_document(&id).await.unwrap().is_none());
        assert!(svc.status.get(&id).await.unwrap().is_none());
        assert!(svc.blobs.get(&key).await.is_err());
    }
}
