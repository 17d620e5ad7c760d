//! Pipeline stage handlers.
//!
//! Each stage owns a run of status transitions:
//!
//! | stage | consumes | transitions |
//! |-------|----------|-------------|
//! | [`extraction`] | `DocumentUploaded` | downloading → extracting → analyzing |
//! | [`embedding`] | `DocumentProcessed{success}` | embedding → indexed |
//!
//! A transition the metadata store rejects means the document already
//! moved on (a redelivery after completion, or a terminal state), and the
//! handler stops without side effects.

pub mod embedding;
pub mod extraction;

pub use embedding::EmbeddingStage;
pub use extraction::ExtractionStage;

use crate::error::{Error, Result};
use crate::models::DocumentStatus;
use crate::services::Services;

/// Move `document_id` to `next` and record the snapshot. Returns `false`
/// when the metadata store refused the transition.
pub(crate) async fn advance(
    svc: &Services,
    document_id: &str,
    next: DocumentStatus,
    progress: u8,
) -> Result<bool> {
    enter(svc, document_id, next, progress, &next.predecessors()).await
}

/// Like [`advance`], but also accepts the later steps in `from`. Stage entry
/// uses this so a redelivery restarts a stage that a failed attempt or a
/// lost lease left part-way through.
pub(crate) async fn resume(
    svc: &Services,
    document_id: &str,
    next: DocumentStatus,
    progress: u8,
    from: &[DocumentStatus],
) -> Result<bool> {
    enter(svc, document_id, next, progress, from).await
}

async fn enter(
    svc: &Services,
    document_id: &str,
    next: DocumentStatus,
    progress: u8,
    allowed: &[DocumentStatus],
) -> Result<bool> {
    if !svc
        .metadata
        .transition_from(document_id, next, allowed)
        .await?
    {
        tracing::debug!(document_id, stage = %next, "transition rejected; skipping");
        return Ok(false);
    }
    svc.status
        .record(document_id, next, progress, None, None)
        .await?;
    Ok(true)
}

/// Check that `document_id` survived an index write. A document deleted
/// meanwhile has its index entries removed again and `false` is returned.
pub(crate) async fn still_present(svc: &Services, document_id: &str) -> Result<bool> {
    if svc.metadata.get_document(document_id).await?.is_some() {
        return Ok(true);
    }
    svc.indexer.delete(document_id).await?;
    tracing::info!(document_id, "document deleted during indexing; entries removed");
    Ok(false)
}

/// Mark a document `failed` at whatever stage it had reached.
///
/// The snapshot keeps the progress of the failed stage and an error of the
/// form `"<Kind> during <stage>: <message>"`. Returns `false` if the document
/// is gone or already terminal.
pub async fn fail_document(svc: &Services, document_id: &str, err: &Error) -> Result<bool> {
    let Some(doc) = svc.metadata.get_document(document_id).await? else {
        return Ok(false);
    };
    if doc.status.is_terminal() {
        return Ok(false);
    }
    let stage = doc.status;
    let progress = match svc.status.get(document_id).await? {
        Some(snapshot) if snapshot.stage == stage => snapshot.progress,
        _ => stage.entry_progress(),
    };

    if !svc
        .metadata
        .transition(document_id, DocumentStatus::Failed)
        .await?
    {
        return Ok(false);
    }
    let message = format!("{} during {}: {}", err.kind(), stage, err.message());
    svc.status
        .record(
            document_id,
            DocumentStatus::Failed,
            progress,
            Some(&message),
            Some(stage),
        )
        .await?;
    tracing::warn!(document_id, stage = %stage, error = %message, "document failed");
    Ok(true)
}

/// Note a retryable error on the snapshot without leaving the current stage.
pub(crate) async fn note_retry(svc: &Services, document_id: &str, err: &Error) -> Result<()> {
    let Some(snapshot) = svc.status.get(document_id).await? else {
        return Ok(());
    };
    if snapshot.stage.is_terminal() {
        return Ok(());
    }
    let message = format!("{} (retrying)", err.message());
    svc.status
        .record(
            document_id,
            snapshot.stage,
            snapshot.progress,
            Some(&message),
            None,
        )
        .await?;
    Ok(())
}
