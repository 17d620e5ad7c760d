//! Stage workers.
//!
//! A [`StageRunner`] pulls deliveries for one consumer group from the
//! [`EventBus`], hands the decoded event to its [`StageHandler`], and only
//! then settles the delivery:
//!
//! * success → ack
//! * retryable error with attempts left → redeliver after backoff
//! * anything else → `on_failure`, then ack (`Validation`,
//!   `UnsupportedFormat`) or dead-letter (`NotFound`, exhausted retries)
//! * undecodable payload → dead-letter
//!
//! A crash before settling leaves the lease to expire and the delivery is
//! picked up again; handlers are idempotent so that is safe.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::bus::{ConsumerGroup, Delivery, EventBus};
use crate::config::PipelineConfig;
use crate::error::Error;
use crate::events::Event;

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn group(&self) -> ConsumerGroup;

    async fn handle(&self, event: &Event) -> crate::error::Result<()>;

    /// Called before a retryable failure is redelivered.
    async fn on_retry(&self, _event: &Event, _err: &Error) {}

    /// Called once when the event will not be retried.
    async fn on_failure(&self, event: &Event, err: &Error) -> crate::error::Result<()>;
}

pub struct StageRunner {
    bus: Arc<dyn EventBus>,
    handler: Arc<dyn StageHandler>,
    pipeline: PipelineConfig,
}

impl StageRunner {
    pub fn new(
        bus: Arc<dyn EventBus>,
        handler: Arc<dyn StageHandler>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            bus,
            handler,
            pipeline,
        }
    }

    pub fn group(&self) -> ConsumerGroup {
        self.handler.group()
    }

    /// Claim and settle at most one delivery. Returns `false` when nothing
    /// was due.
    pub async fn process_one(&self) -> Result<bool> {
        let group = self.group();
        let Some(delivery) = self.bus.claim(group, self.pipeline.lease()).await? else {
            return Ok(false);
        };

        let event = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                self.bus.dead_letter(&delivery, &format!("{:#}", e)).await?;
                return Ok(true);
            }
        };

        let span = tracing::info_span!(
            "stage",
            stage = group.as_str(),
            document_id = event.document_id(),
            attempt = delivery.attempt
        );
        self.dispatch(&delivery, &event).instrument(span).await?;
        Ok(true)
    }

    async fn dispatch(&self, delivery: &Delivery, event: &Event) -> Result<()> {
        let err = match self.handler.handle(event).await {
            Ok(()) => {
                tracing::debug!(kind = event.kind(), "handled");
                return self.bus.ack(delivery).await;
            }
            Err(err) => err,
        };

        if err.is_retryable() && delivery.attempt < self.pipeline.max_attempts {
            let delay = self.pipeline.backoff(delivery.attempt);
            tracing::warn!(
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "stage failed; will retry"
            );
            self.handler.on_retry(event, &err).await;
            return self.bus.retry(delivery, delay, &err.to_string()).await;
        }

        tracing::error!(error = %err, kind = err.kind(), "stage failed");
        if let Err(e) = self.handler.on_failure(event, &err).await {
            tracing::error!(error = %e, "failed to record stage failure");
        }
        match &err {
            Error::NotFound(_) | Error::Dependency(_) => {
                self.bus.dead_letter(delivery, &err.to_string()).await
            }
            _ => self.bus.ack(delivery).await,
        }
    }

    /// Process deliveries until none is immediately due. Returns how many
    /// were settled.
    pub async fn drain(&self) -> Result<usize> {
        let mut settled = 0;
        while self.process_one().await? {
            settled += 1;
        }
        Ok(settled)
    }
}

/// Drain every runner repeatedly until a full round settles nothing, so
/// events published by one stage are consumed by the next.
pub async fn drain_all(runners: &[Arc<StageRunner>]) -> Result<usize> {
    let mut total = 0;
    loop {
        let mut round = 0;
        for runner in runners {
            round += runner.drain().await?;
        }
        if round == 0 {
            return Ok(total);
        }
        total += round;
    }
}

/// Start `workers` concurrent loops per runner. Each loop exits when
/// `shutdown` flips to `true`.
pub fn spawn_workers(
    runners: &[Arc<StageRunner>],
    workers: usize,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for runner in runners {
        for worker in 0..workers {
            let runner = Arc::clone(runner);
            let mut shutdown = shutdown.clone();
            set.spawn(async move {
                tracing::debug!(stage = runner.group().as_str(), worker, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match runner.process_one().await {
                        Ok(true) => continue,
                        Ok(false) => {
                            tokio::select! {
                                _ = runner.bus.wait(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(e) => {
                            let error = format!("{:#}", e);
                            tracing::error!(
                                stage = runner.group().as_str(),
                                error = %error,
                                "worker loop error"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
                tracing::debug!(stage = runner.group().as_str(), worker, "worker stopped");
            });
        }
    }
    set
}

/// Prune settled bus rows older than `keep`, then again every `every`,
/// until `shutdown` flips to `true`.
pub async fn retention_sweep(
    bus: Arc<dyn EventBus>,
    keep: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = bus.prune(keep).await {
            let error = format!("{:#}", e);
            tracing::warn!(error = %error, "event log prune failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
    tracing::debug!("retention sweep stopped");
}
