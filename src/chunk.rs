//! Fixed-window text chunker.
//!
//! Splits extracted text into contiguous windows of `window_chars`
//! characters (not bytes, so multi-byte text never splits mid-character).
//! The last window may be shorter. Whitespace-only windows are dropped and
//! the surviving windows are numbered from 0 in split order.
//!
//! Each chunk carries a deterministic row id and vector id derived from its
//! document id and index, plus a SHA-256 hash of its text for staleness
//! detection, so re-chunking the same text yields byte-identical rows.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::DocumentChunk;

pub fn chunk_text(document_id: &str, text: &str, window_chars: usize) -> Vec<DocumentChunk> {
    let window = window_chars.max(1);
    let chars: Vec<char> = text.chars().collect();

    chars
        .chunks(window)
        .map(|w| w.iter().collect::<String>())
        .filter(|w| !w.trim().is_empty())
        .enumerate()
        .map(|(i, content)| make_chunk(document_id, i as i64, content))
        .collect()
}

/// Vector index id of a chunk: `"{documentId}:{chunkIndex}"`.
pub fn vector_id(document_id: &str, chunk_index: i64) -> String {
    format!("{}:{}", document_id, chunk_index)
}

/// Row id of a chunk: UUID v5 (URL namespace) over its vector id.
pub fn chunk_id(document_id: &str, chunk_index: i64) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        vector_id(document_id, chunk_index).as_bytes(),
    )
    .to_string()
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: i64, content: String) -> DocumentChunk {
    DocumentChunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        content_hash: content_hash(&content),
        content,
        vector_id: None,
    }
}
