//! Status aggregator.
//!
//! Durable last-write-wins snapshot per document, read by the status
//! endpoint. Stages write here after the metadata store has accepted the
//! corresponding transition; the aggregator itself applies no rules.
//! Each write is a single-row upsert, so a concurrent reader sees either
//! the old snapshot or the new one.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::models::{ts_to_datetime, DocumentStatus, StatusSnapshot};

#[derive(Clone)]
pub struct StatusAggregator {
    pool: SqlitePool,
}

impl StatusAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        document_id: &str,
        stage: DocumentStatus,
        progress: u8,
        error: Option<&str>,
        failed_stage: Option<DocumentStatus>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO document_status (document_id, stage, progress, error, failed_stage, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                stage = excluded.stage,
                progress = excluded.progress,
                error = excluded.error,
                failed_stage = excluded.failed_stage,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document_id)
        .bind(stage.as_str())
        .bind(progress.min(100) as i64)
        .bind(error)
        .bind(failed_stage.map(|s| s.as_str()))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record status for {}", document_id))?;
        Ok(())
    }

    pub async fn get(&self, document_id: &str) -> Result<Option<StatusSnapshot>> {
        let row = sqlx::query(
            "SELECT document_id, stage, progress, error, failed_stage, updated_at
             FROM document_status WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stage: String = row.get("stage");
        let failed_stage: Option<String> = row.get("failed_stage");
        let progress: i64 = row.get("progress");

        Ok(Some(StatusSnapshot {
            document_id: row.get("document_id"),
            stage: DocumentStatus::parse(&stage)
                .with_context(|| format!("unknown stage '{}'", stage))?,
            progress: progress.clamp(0, 100) as u8,
            error: row.get("error"),
            failed_stage: failed_stage.as_deref().and_then(DocumentStatus::parse),
            updated_at: ts_to_datetime(row.get("updated_at")),
        }))
    }

    pub async fn remove(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM document_status WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_data_dir(tmp.path());
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let agg = StatusAggregator::new(pool);

        assert!(agg.get("d1").await.unwrap().is_none());

        agg.record("d1", DocumentStatus::Embedding, 72, None, None)
            .await
            .unwrap();
        agg.record(
            "d1",
            DocumentStatus::Failed,
            72,
            Some("DependencyError during embedding: provider down"),
            Some(DocumentStatus::Embedding),
        )
        .await
        .unwrap();

        let snap = agg.get("d1").await.unwrap().unwrap();
        assert_eq!(snap.stage, DocumentStatus::Failed);
        assert_eq!(snap.progress, 72);
        assert_eq!(snap.failed_stage, Some(DocumentStatus::Embedding));
        assert!(snap.error.unwrap().starts_with("DependencyError"));

        agg.remove("d1").await.unwrap();
        assert!(agg.get("d1").await.unwrap().is_none());
    }
}
