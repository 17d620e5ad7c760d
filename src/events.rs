//! Pipeline events.
//!
//! Each event is an immutable fact about one document. The set of kinds is
//! closed: a payload that does not decode into one of these variants is
//! dead-lettered by the consumer rather than guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ExtractedMetadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    DocumentUploaded(DocumentUploaded),
    DocumentProcessed(DocumentProcessed),
    DocumentIndexed(DocumentIndexed),
    DocumentEmbedded(DocumentEmbedded),
    DocumentDeleted(DocumentDeleted),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUploaded {
    pub document_id: String,
    pub owner_id: String,
    pub filename: String,
    pub mime_type: String,
    pub storage_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of the extraction stage. On success `text_content` and
/// `metadata` are set; on failure `error` is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentProcessed {
    pub document_id: String,
    pub owner_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExtractedMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentIndexed {
    pub document_id: String,
    pub owner_id: String,
    pub search_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEmbedded {
    pub document_id: String,
    pub owner_id: String,
    pub chunk_count: usize,
    pub collection: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDeleted {
    pub document_id: String,
    pub owner_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::DocumentUploaded(_) => "DocumentUploaded",
            Event::DocumentProcessed(_) => "DocumentProcessed",
            Event::DocumentIndexed(_) => "DocumentIndexed",
            Event::DocumentEmbedded(_) => "DocumentEmbedded",
            Event::DocumentDeleted(_) => "DocumentDeleted",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Event::DocumentUploaded(e) => &e.document_id,
            Event::DocumentProcessed(e) => &e.document_id,
            Event::DocumentIndexed(e) => &e.document_id,
            Event::DocumentEmbedded(e) => &e.document_id,
            Event::DocumentDeleted(e) => &e.document_id,
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            Event::DocumentUploaded(e) => &e.owner_id,
            Event::DocumentProcessed(e) => &e.owner_id,
            Event::DocumentIndexed(e) => &e.owner_id,
            Event::DocumentEmbedded(e) => &e.owner_id,
            Event::DocumentDeleted(e) => &e.owner_id,
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
