//! Durable delivery queue
//!
//! Messages are rows in `delivery_jobs`. A consumer claims due rows by
//! leasing them; a row is settled as delivered, rescheduled with backoff,
//! or marked dead after the last attempt. A crashed consumer's lease runs
//! out and the row is claimed again, so delivery is at-least-once.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::sync::{Notify, watch};

use super::actors::ActorDirectory;
use super::delivery::DeliveryDispatcher;
use super::keys::{Kek, unwrap_key};
use crate::config::DeliveryConfig;
use crate::data::{Actor, Database, DeliveryJob, EntityId};
use crate::error::AppError;

/// Deliveries in flight per claimed batch
const DELIVERY_CONCURRENCY: usize = 8;

/// Minimum gap between two prune passes of settled jobs
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Message kind; only activities are queued today
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Activity,
}

/// Which key the consumer must sign with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRef {
    pub key_id: String,
}

/// One activity for one recipient
///
/// Carries no key material; the consumer unwraps the sender's key itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub actor_id: String,
    pub to_actor_id: String,
    pub content: serde_json::Value,
    pub signing: SigningRef,
}

impl DeliveryMessage {
    pub fn activity(from: &Actor, to_actor_id: &str, content: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Activity,
            actor_id: from.id.clone(),
            to_actor_id: to_actor_id.to_string(),
            content,
            signing: SigningRef {
                key_id: from.key_id(),
            },
        }
    }
}

/// Producer side of the work queue
pub trait DeliveryQueue: Send + Sync {
    fn enqueue(
        &self,
        message: DeliveryMessage,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// SQLite-backed [`DeliveryQueue`]
#[derive(Clone)]
pub struct SqliteDeliveryQueue {
    db: Arc<Database>,
    notify: Arc<Notify>,
}

impl SqliteDeliveryQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Lease up to `limit` due jobs for `lease`
    pub async fn claim(&self, limit: u32, lease: Duration) -> Result<Vec<DeliveryJob>, AppError> {
        let now = now_ms();
        let lease_until = now.saturating_add(lease.as_millis() as i64);
        let jobs = self.db.claim_delivery_jobs(now, lease_until, limit).await?;

        if !jobs.is_empty() {
            crate::metrics::QUEUE_MESSAGES_TOTAL
                .with_label_values(&["claimed"])
                .inc_by(jobs.len() as u64);
        }

        Ok(jobs)
    }

    /// Resolves after the next enqueue
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl DeliveryQueue for SqliteDeliveryQueue {
    async fn enqueue(&self, message: DeliveryMessage) -> Result<(), AppError> {
        let message_json = serde_json::to_string(&message).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("failed to serialize delivery message: {}", e))
        })?;
        let id = EntityId::new().0;

        self.db.insert_delivery_job(&id, &message_json, now_ms()).await?;

        crate::metrics::QUEUE_MESSAGES_TOTAL
            .with_label_values(&["enqueued"])
            .inc();
        tracing::debug!(
            job_id = %id,
            actor_id = %message.actor_id,
            to_actor_id = %message.to_actor_id,
            "Queued delivery"
        );

        self.notify.notify_one();
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delay before retry number `attempt` (1-based): doubling from `base`,
/// capped at `max`, plus up to a second of jitter.
pub fn next_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u32 << pow).min(max);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    delay + Duration::from_millis(jitter_ms)
}

/// How a job ended up after one processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Retrying,
    Dead,
}

/// Queue consumer
///
/// Spawned by the binary; the library itself never starts it.
pub struct DeliveryWorker {
    queue: SqliteDeliveryQueue,
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    dispatcher: DeliveryDispatcher,
    kek: Kek,
    settings: DeliveryConfig,
}

impl DeliveryWorker {
    pub fn new(
        queue: SqliteDeliveryQueue,
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        dispatcher: DeliveryDispatcher,
        kek: Kek,
        settings: DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            db,
            directory,
            dispatcher,
            kek,
            settings,
        }
    }

    /// Process batches until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.settings.batch_size,
            max_attempts = self.settings.max_attempts,
            "Delivery worker started"
        );

        let tick = Duration::from_secs(self.settings.poll_interval_seconds.max(1));
        let mut last_prune: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_prune.is_none_or(|at| at.elapsed() >= PRUNE_INTERVAL) {
                if let Err(error) = self.prune_settled().await {
                    tracing::warn!(%error, "Failed to prune settled delivery jobs");
                }
                last_prune = Some(Instant::now());
            }

            match self.run_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = tokio::time::sleep(tick) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(%error, "Delivery worker pass failed");
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!("Delivery worker stopped");
    }

    /// Delete delivered and dead jobs older than the retention period
    pub async fn prune_settled(&self) -> Result<u64, AppError> {
        let retention_ms = self.settings.retention_seconds.saturating_mul(1000);
        let cutoff = now_ms().saturating_sub(i64::try_from(retention_ms).unwrap_or(i64::MAX));
        let pruned = self.db.prune_settled_jobs(cutoff).await?;

        if pruned > 0 {
            crate::metrics::QUEUE_MESSAGES_TOTAL
                .with_label_values(&["pruned"])
                .inc_by(pruned);
            tracing::info!(pruned, "Pruned settled delivery jobs");
        }

        Ok(pruned)
    }

    /// Claim and process one batch. Returns the number of jobs handled.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let lease = Duration::from_secs(self.settings.lease_seconds);
        let jobs = self.queue.claim(self.settings.batch_size, lease).await?;
        let count = jobs.len();

        stream::iter(jobs)
            .for_each_concurrent(DELIVERY_CONCURRENCY, |job| async move {
                let job_id = job.id.clone();
                if let Err(error) = self.process(job).await {
                    // The lease expires and the job is claimed again later.
                    tracing::error!(%error, job_id = %job_id, "Failed to settle delivery job");
                }
            })
            .await;

        Ok(count)
    }

    async fn process(&self, job: DeliveryJob) -> Result<JobOutcome, AppError> {
        let attempt = job.attempt + 1;

        let message: DeliveryMessage = match serde_json::from_str(&job.message_json) {
            Ok(message) => message,
            Err(error) => {
                return self
                    .dead(&job.id, attempt, &format!("malformed message: {}", error))
                    .await;
            }
        };

        let sender = match self.db.get_actor(&message.actor_id).await? {
            Some(actor) if actor.is_local => actor,
            _ => {
                return self
                    .dead(&job.id, attempt, "sender is not a local actor")
                    .await;
            }
        };

        if message.signing.key_id != sender.key_id() {
            return self
                .dead(&job.id, attempt, "signing key does not belong to sender")
                .await;
        }

        let Some(material) = sender.key_material.as_ref() else {
            return self.dead(&job.id, attempt, "sender has no key").await;
        };

        // PBKDF2 blocks; run it off the async workers
        let unwrapped = tokio::task::spawn_blocking({
            let kek = self.kek.clone();
            let material = material.clone();
            move || unwrap_key(&kek, &material.wrapped_private_key, &material.salt)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let signing_key = match unwrapped {
            Ok(key) => key,
            Err(error) => {
                tracing::error!(actor_id = %sender.id, "Cannot unwrap sender key");
                return self.dead(&job.id, attempt, &error.to_string()).await;
            }
        };

        let Some(recipient) = self.directory.get_and_cache(&message.to_actor_id).await? else {
            return self
                .retry_or_dead(&job.id, attempt, "recipient could not be resolved")
                .await;
        };

        match self
            .dispatcher
            .deliver_to_actor(&signing_key, &sender, &recipient, &message.content)
            .await
        {
            Ok(()) => {
                self.db.mark_job_delivered(&job.id, attempt, now_ms()).await?;
                crate::metrics::QUEUE_MESSAGES_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                Ok(JobOutcome::Delivered)
            }
            Err(error) => {
                tracing::warn!(%error, job_id = %job.id, attempt, "Delivery attempt failed");
                self.retry_or_dead(&job.id, attempt, &error.to_string()).await
            }
        }
    }

    async fn retry_or_dead(
        &self,
        job_id: &str,
        attempt: i64,
        reason: &str,
    ) -> Result<JobOutcome, AppError> {
        if attempt >= i64::from(self.settings.max_attempts) {
            return self.dead(job_id, attempt, reason).await;
        }

        let delay = next_backoff(
            attempt as u32,
            Duration::from_secs(self.settings.base_backoff_seconds),
            Duration::from_secs(self.settings.max_backoff_seconds),
        );
        let next_attempt_at = now_ms().saturating_add(delay.as_millis() as i64);
        self.db
            .reschedule_job(job_id, attempt, next_attempt_at, reason)
            .await?;

        crate::metrics::QUEUE_MESSAGES_TOTAL
            .with_label_values(&["rescheduled"])
            .inc();
        tracing::debug!(
            job_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Delivery rescheduled"
        );
        Ok(JobOutcome::Retrying)
    }

    async fn dead(&self, job_id: &str, attempt: i64, reason: &str) -> Result<JobOutcome, AppError> {
        self.db
            .mark_job_dead(job_id, attempt, reason, now_ms())
            .await?;
        crate::metrics::QUEUE_MESSAGES_TOTAL
            .with_label_values(&["dead"])
            .inc();
        tracing::warn!(job_id, attempt, reason, "Delivery job dead");
        Ok(JobOutcome::Dead)
    }
}
