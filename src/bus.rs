//! Durable event bus over SQLite.
//!
//! `publish` records an [`Event`] in the `events` table and fans out one
//! `deliveries` row per subscribed [`ConsumerGroup`] in the same
//! transaction. Consumers lease deliveries with [`EventBus::claim`] and
//! settle them with `ack`, `retry`, or `dead_letter` only after their side
//! effects are durable, so a crash mid-handler leads to redelivery once the
//! lease expires.
//!
//! # Delivery states
//!
//! | state | meaning |
//! |-------|---------|
//! | `pending` | waiting; due once `available_at <= now` |
//! | `leased` | claimed by a worker until `available_at` (lease expiry) |
//! | `acked` | handled |
//! | `dead` | moved aside after a permanent failure |
//!
//! Acked deliveries and events nobody still has to handle are removed by
//! [`EventBus::prune`] once they are older than the retention window.
//! Dead-lettered deliveries and their events are kept for inspection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;

use crate::events::Event;

/// Independent consumer of the event stream. Each group receives its own
/// copy of every event it subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerGroup {
    Extraction,
    Embedding,
}

impl ConsumerGroup {
    pub const ALL: [ConsumerGroup; 2] = [ConsumerGroup::Extraction, ConsumerGroup::Embedding];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerGroup::Extraction => "extraction",
            ConsumerGroup::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|g| g.as_str() == s)
    }

    pub fn subscribes_to(&self, event: &Event) -> bool {
        match (self, event) {
            (ConsumerGroup::Extraction, Event::DocumentUploaded(_)) => true,
            (ConsumerGroup::Embedding, Event::DocumentProcessed(p)) => p.success,
            _ => false,
        }
    }
}

/// A leased delivery. `attempt` counts this delivery (1 on first claim).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub event_id: i64,
    pub group: ConsumerGroup,
    pub attempt: u32,
    pub payload: String,
}

impl Delivery {
    pub fn decode(&self) -> Result<Event> {
        Event::from_json(&self.payload)
            .with_context(|| format!("undecodable payload for event {}", self.event_id))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub delivery_id: i64,
    pub event_id: i64,
    pub consumer: String,
    pub kind: String,
    pub document_id: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Record `event` and enqueue it for every subscribed group. Returns the
    /// event id.
    async fn publish(&self, event: &Event) -> Result<i64>;

    /// Lease the oldest due delivery for `group`, if any.
    async fn claim(&self, group: ConsumerGroup, lease: Duration) -> Result<Option<Delivery>>;

    /// Mark handled. A no-op if the lease was lost to another worker.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return to the queue, due again after `delay`.
    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> Result<()>;

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<()>;

    /// Wait until something may have been published, or `timeout` elapses.
    async fn wait(&self, timeout: Duration);

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>>;

    /// Deliveries for `group` not yet acked or dead-lettered.
    async fn outstanding(&self, group: ConsumerGroup) -> Result<i64>;

    /// Delete acked deliveries last touched more than `older_than` ago,
    /// then events older than that with no delivery rows left.
    async fn prune(&self, older_than: Duration) -> Result<Pruned>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pruned {
    pub deliveries: u64,
    pub events: u64,
}

pub struct SqliteEventBus {
    pool: SqlitePool,
    notify: Arc<Notify>,
}

impl SqliteEventBus {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl EventBus for SqliteEventBus {
    async fn publish(&self, event: &Event) -> Result<i64> {
        let payload = event.to_json()?;
        let now = now_ms();

        let mut tx = self.pool.begin().await?;
        let event_id: i64 = sqlx::query_scalar(
            "INSERT INTO events (kind, document_id, payload, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(event.kind())
        .bind(event.document_id())
        .bind(&payload)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("failed to append event")?;

        for group in ConsumerGroup::ALL {
            if !group.subscribes_to(event) {
                continue;
            }
            sqlx::query(
                "INSERT INTO deliveries (event_id, consumer, state, attempts, available_at, updated_at)
                 VALUES (?, ?, 'pending', 0, ?, ?)",
            )
            .bind(event_id)
            .bind(group.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(
            event_id,
            kind = event.kind(),
            document_id = event.document_id(),
            "published event"
        );
        self.notify.notify_waiters();
        Ok(event_id)
    }

    async fn claim(&self, group: ConsumerGroup, lease: Duration) -> Result<Option<Delivery>> {
        let now = now_ms();
        let lease_until = now + lease.as_millis() as i64;

        // Single statement so concurrent workers never lease the same row.
        // An expired lease is picked up again here (crash recovery).
        let row = sqlx::query(
            r#"
            UPDATE deliveries
            SET state = 'leased', attempts = attempts + 1, available_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM deliveries
                WHERE consumer = ? AND state IN ('pending', 'leased') AND available_at <= ?
                ORDER BY available_at, id
                LIMIT 1
            )
            RETURNING id, event_id, attempts
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(group.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim delivery")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let event_id: i64 = row.get("event_id");
        let attempts: i64 = row.get("attempts");

        let payload: String = sqlx::query_scalar("SELECT payload FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("event {} missing for delivery {}", event_id, id))?;

        Ok(Some(Delivery {
            id,
            event_id,
            group,
            attempt: attempts as u32,
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET state = 'acked', updated_at = ?
             WHERE id = ? AND state = 'leased' AND attempts = ?",
        )
        .bind(now_ms())
        .bind(delivery.id)
        .bind(delivery.attempt as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            "UPDATE deliveries SET state = 'pending', available_at = ?, last_error = ?, updated_at = ?
             WHERE id = ? AND state = 'leased' AND attempts = ?",
        )
        .bind(now + delay.as_millis() as i64)
        .bind(error)
        .bind(now)
        .bind(delivery.id)
        .bind(delivery.attempt as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET state = 'dead', last_error = ?, updated_at = ?
             WHERE id = ? AND state = 'leased' AND attempts = ?",
        )
        .bind(error)
        .bind(now_ms())
        .bind(delivery.id)
        .bind(delivery.attempt as i64)
        .execute(&self.pool)
        .await?;
        tracing::warn!(
            delivery_id = delivery.id,
            event_id = delivery.event_id,
            consumer = delivery.group.as_str(),
            error,
            "delivery dead-lettered"
        );
        Ok(())
    }

    async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.event_id, d.consumer, e.kind, e.document_id, d.attempts,
                   d.last_error, d.updated_at
            FROM deliveries d JOIN events e ON e.id = d.event_id
            WHERE d.state = 'dead'
            ORDER BY d.updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DeadLetter {
                delivery_id: row.get("id"),
                event_id: row.get("event_id"),
                consumer: row.get("consumer"),
                kind: row.get("kind"),
                document_id: row.get("document_id"),
                attempts: row.get("attempts"),
                last_error: row.get("last_error"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    async fn outstanding(&self, group: ConsumerGroup) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deliveries WHERE consumer = ? AND state IN ('pending', 'leased')",
        )
        .bind(group.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn prune(&self, older_than: Duration) -> Result<Pruned> {
        let cutoff = now_ms().saturating_sub(older_than.as_millis() as i64);

        let mut tx = self.pool.begin().await?;
        let deliveries = sqlx::query("DELETE FROM deliveries WHERE state = 'acked' AND updated_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("failed to prune deliveries")?
            .rows_affected();
        let events = sqlx::query(
            "DELETE FROM events WHERE created_at < ?
             AND NOT EXISTS (SELECT 1 FROM deliveries d WHERE d.event_id = events.id)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .context("failed to prune events")?
        .rows_affected();
        tx.commit().await?;

        if deliveries > 0 || events > 0 {
            tracing::info!(deliveries, events, "pruned event log");
        }
        Ok(Pruned { deliveries, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{DocumentDeleted, DocumentProcessed, DocumentUploaded};
    use chrono::Utc;
    use tempfile::TempDir;

    async fn bus() -> (TempDir, SqliteEventBus) {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_data_dir(tmp.path());
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteEventBus::new(pool))
    }

    fn uploaded(id: &str) -> Event {
        Event::DocumentUploaded(DocumentUploaded {
            document_id: id.into(),
            owner_id: "u1".into(),
            filename: "a.txt".into(),
            mime_type: "text/plain".into(),
            storage_key: "k_a.txt".into(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn routes_events_to_subscribed_groups() {
        let (_tmp, bus) = bus().await;
        bus.publish(&uploaded("d1")).await.unwrap();
        bus.publish(&Event::DocumentProcessed(DocumentProcessed {
            document_id: "d2".into(),
            owner_id: "u1".into(),
            success: false,
            text_content: None,
            metadata: None,
            error: Some("boom".into()),
            timestamp: Utc::now(),
        }))
        .await
        .unwrap();

        assert_eq!(bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 1);
        // Failed processing is a recorded fact with no consumer.
        assert_eq!(bus.outstanding(ConsumerGroup::Embedding).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claimed_delivery_is_not_claimed_twice() {
        let (_tmp, bus) = bus().await;
        bus.publish(&uploaded("d1")).await.unwrap();

        let lease = Duration::from_secs(60);
        let first = bus.claim(ConsumerGroup::Extraction, lease).await.unwrap();
        let second = bus.claim(ConsumerGroup::Extraction, lease).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let delivery = first.unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.decode().unwrap().document_id(), "d1");
        bus.ack(&delivery).await.unwrap();
        assert_eq!(bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let (_tmp, bus) = bus().await;
        bus.publish(&uploaded("d1")).await.unwrap();

        let first = bus
            .claim(ConsumerGroup::Extraction, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let again = bus
            .claim(ConsumerGroup::Extraction, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.attempt, 2);

        // The stale holder's ack must not settle the new lease.
        bus.ack(&first).await.unwrap();
        assert_eq!(bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 1);
        bus.ack(&again).await.unwrap();
        assert_eq!(bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_delays_and_dead_letter_parks() {
        let (_tmp, bus) = bus().await;
        bus.publish(&uploaded("d1")).await.unwrap();
        let lease = Duration::from_secs(60);

        let d = bus.claim(ConsumerGroup::Extraction, lease).await.unwrap().unwrap();
        bus.retry(&d, Duration::from_secs(3600), "blob store down")
            .await
            .unwrap();
        assert!(bus.claim(ConsumerGroup::Extraction, lease).await.unwrap().is_none());

        bus.publish(&uploaded("d2")).await.unwrap();
        let d2 = bus.claim(ConsumerGroup::Extraction, lease).await.unwrap().unwrap();
        bus.dead_letter(&d2, "NotFoundError").await.unwrap();

        let dead = bus.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].document_id, "d2");
        assert_eq!(dead[0].consumer, "extraction");
        assert_eq!(dead[0].last_error.as_deref(), Some("NotFoundError"));
    }

    #[tokio::test]
    async fn prune_keeps_pending_and_dead_deliveries() {
        let (_tmp, bus) = bus().await;
        let lease = Duration::from_secs(60);
        for id in ["done", "dead", "waiting"] {
            bus.publish(&uploaded(id)).await.unwrap();
        }
        // Consumed by nobody; only the event row exists.
        bus.publish(&Event::DocumentDeleted(DocumentDeleted {
            document_id: "gone".into(),
            owner_id: "u1".into(),
            timestamp: Utc::now(),
        }))
        .await
        .unwrap();

        let done = bus.claim(ConsumerGroup::Extraction, lease).await.unwrap().unwrap();
        bus.ack(&done).await.unwrap();
        let dead = bus.claim(ConsumerGroup::Extraction, lease).await.unwrap().unwrap();
        bus.dead_letter(&dead, "NotFoundError").await.unwrap();

        // Nothing is old enough yet.
        let kept = bus.prune(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(kept, Pruned::default());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let pruned = bus.prune(Duration::ZERO).await.unwrap();
        assert_eq!(pruned, Pruned { deliveries: 1, events: 2 });

        let events: Vec<String> = sqlx::query_scalar("SELECT document_id FROM events ORDER BY id")
            .fetch_all(&bus.pool)
            .await
            .unwrap();
        assert_eq!(events, vec!["dead", "waiting"]);
        assert_eq!(bus.dead_letters(10).await.unwrap().len(), 1);
        assert_eq!(bus.outstanding(ConsumerGroup::Extraction).await.unwrap(), 1);
    }
}
