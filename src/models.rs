//! Core data models used throughout docusearch.
//!
//! These types represent the documents, chunks, status snapshots, and query
//! history records that flow through the ingestion and retrieval pipeline.
//! They serialize in camelCase because they are returned verbatim by the
//! HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage of a document.
///
/// Ordered: `uploaded → downloading → extracting → analyzing → embedding →
/// indexed`. `failed` may be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Downloading,
    Extracting,
    Analyzing,
    Embedding,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 7] = [
        DocumentStatus::Uploaded,
        DocumentStatus::Downloading,
        DocumentStatus::Extracting,
        DocumentStatus::Analyzing,
        DocumentStatus::Embedding,
        DocumentStatus::Indexed,
        DocumentStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Downloading => "downloading",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Analyzing => "analyzing",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Uploaded => 0,
            DocumentStatus::Downloading => 1,
            DocumentStatus::Extracting => 2,
            DocumentStatus::Analyzing => 3,
            DocumentStatus::Embedding => 4,
            DocumentStatus::Indexed => 5,
            DocumentStatus::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Failed)
    }

    /// Progress percentage reported when a stage is entered.
    pub fn entry_progress(&self) -> u8 {
        match self {
            DocumentStatus::Uploaded => 0,
            DocumentStatus::Downloading => 10,
            DocumentStatus::Extracting => 30,
            DocumentStatus::Analyzing => 50,
            DocumentStatus::Embedding => 60,
            DocumentStatus::Indexed => 100,
            DocumentStatus::Failed => 0,
        }
    }

    /// States from which a transition into `self` is accepted.
    ///
    /// Re-entering the current state is allowed so a stage can report
    /// progress; nothing leaves a terminal state.
    pub fn predecessors(&self) -> Vec<DocumentStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| !from.is_terminal())
            .filter(|from| *self == DocumentStatus::Failed || from.rank() <= self.rank())
            .collect()
    }

    #[cfg(test)]
    fn can_transition_to(&self, next: DocumentStatus) -> bool {
        next.predecessors().contains(self)
    }

    /// True once the document has moved past `stage` (or failed).
    pub fn is_past(&self, stage: DocumentStatus) -> bool {
        self.rank() > stage.rank()
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural metadata derived during extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMetadata {
    pub title: String,
    pub author: Option<String>,
    pub page_count: u32,
    pub word_count: usize,
    pub language: String,
    pub created_date: Option<String>,
}

/// A document row owned by the metadata store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub filename: String,
    pub mime_type: String,
    pub storage_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExtractedMetadata>,
    pub status: DocumentStatus,
    pub external_search_id: Option<String>,
    pub external_vector_collection: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contiguous window of a document's extracted text.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub content_hash: String,
    pub vector_id: Option<String>,
}

/// A retrieved chunk used to ground an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub document_id: String,
    pub chunk_index: i64,
    pub vector_id: String,
    pub title: String,
    pub content: String,
    pub score: f32,
}

/// Append-only query history record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub id: String,
    pub user_id: String,
    pub query: String,
    pub answer: String,
    pub intent: String,
    pub entities: Vec<String>,
    pub sources: Vec<Source>,
    pub grounded: bool,
    pub created_at: DateTime<Utc>,
}

/// Last-known pipeline position of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub document_id: String,
    pub stage: DocumentStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<DocumentStatus>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_allowed() {
        assert!(DocumentStatus::Uploaded.can_transition_to(DocumentStatus::Downloading));
        assert!(DocumentStatus::Analyzing.can_transition_to(DocumentStatus::Embedding));
        assert!(DocumentStatus::Embedding.can_transition_to(DocumentStatus::Embedding));
        assert!(DocumentStatus::Embedding.can_transition_to(DocumentStatus::Indexed));
    }

    #[test]
    fn backward_transitions_rejected() {
        assert!(!DocumentStatus::Embedding.can_transition_to(DocumentStatus::Extracting));
        assert!(!DocumentStatus::Analyzing.can_transition_to(DocumentStatus::Uploaded));
    }

    #[test]
    fn failed_reachable_from_any_non_terminal() {
        for st in DocumentStatus::ALL {
            assert_eq!(
                st.can_transition_to(DocumentStatus::Failed),
                !st.is_terminal(),
                "{st}"
            );
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        for next in DocumentStatus::ALL {
            assert!(!DocumentStatus::Indexed.can_transition_to(next));
            assert!(!DocumentStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn parse_roundtrips_names() {
        for st in DocumentStatus::ALL {
            assert_eq!(DocumentStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(DocumentStatus::parse("processing"), None);
    }
}
