//! Worker pool driving the notification lifecycle.
//!
//! A single control loop keeps up to `max_concurrent_workers` send tasks
//! in flight: reap finished tasks, fill free slots from the queue (strict
//! priority order), park briefly when idle. Each task re-reads its row
//! from the store before acting; the queue entry is only a routing hint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db::models::Notification;
use crate::error::AppResult;
use crate::providers::{ProviderRegistry, SendOutcome};
use crate::queue::{PriorityQueue, QueueItem};
use crate::services::scheduler::{Job, Scheduler};
use crate::store::Store;

pub struct WorkerPool {
    store: Store,
    queue: Arc<PriorityQueue>,
    registry: Arc<ProviderRegistry>,
    scheduler: Arc<Scheduler>,
    config: Config,
}

impl WorkerPool {
    pub fn new(
        store: Store,
        queue: Arc<PriorityQueue>,
        registry: Arc<ProviderRegistry>,
        scheduler: Arc<Scheduler>,
        config: Config,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            scheduler,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let max_workers = self.config.dispatch.max_concurrent_workers;
        let mut tasks: JoinSet<()> = JoinSet::new();

        tracing::info!(max_workers, "worker pool started");

        'main: loop {
            // Fill free slots without blocking.
            while tasks.len() < max_workers {
                match self.queue.try_dequeue().await {
                    Some(item) => {
                        let pool = self.clone();
                        tasks.spawn(async move { pool.process(item).await });
                    }
                    None => break,
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break 'main,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = result {
                        if error.is_panic() {
                            tracing::error!("send task panicked: {}", error);
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        // Stop dequeuing, let in-flight sends finish, bounded by the
        // provider timeout plus slack.
        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "worker pool draining in-flight sends");
            let deadline = tokio::time::Instant::now()
                + self.config.provider.timeout
                + Duration::from_secs(5);
            while !tasks.is_empty() {
                if tokio::time::timeout_at(deadline, tasks.join_next())
                    .await
                    .is_err()
                {
                    tracing::warn!("worker pool drain timed out, aborting remaining sends");
                    tasks.abort_all();
                    break;
                }
            }
        }
        tracing::info!("worker pool stopped");
    }

    async fn process(&self, item: QueueItem) {
        if let Err(error) = self.process_inner(&item).await {
            tracing::warn!(notification_id = %item.id, "send task failed: {}", error);
        }
    }

    async fn process_inner(&self, item: &QueueItem) -> AppResult<()> {
        let Some(notification) = self.store.begin_processing(&item.id).await? else {
            tracing::debug!(notification_id = %item.id, "queue entry no longer sendable, dropping");
            return Ok(());
        };

        let provider = self.registry.get(notification.channel)?;
        let outcome = provider.send(&notification).await;

        if outcome.success {
            if self.store.mark_sent(&item.id, &outcome).await?.is_some() {
                self.scheduler.schedule(
                    Job::ConfirmDelivery(item.id.clone()),
                    self.config.dispatch.delivery_confirm_delay,
                );
            }
            Ok(())
        } else {
            self.handle_failure(&notification, &outcome).await
        }
    }

    /// Retry policy: count the attempt; within budget, park the row as
    /// Retrying behind an exponential backoff; otherwise (or for
    /// non-retryable rejections) fail it for good.
    async fn handle_failure(
        &self,
        notification: &Notification,
        outcome: &SendOutcome,
    ) -> AppResult<()> {
        let error = outcome
            .message
            .clone()
            .unwrap_or_else(|| "provider send failed".to_string());

        if outcome.retryable {
            if let Some(updated) = self.store.mark_retrying(&notification.id, &error).await? {
                let delay = self.retry_delay(updated.retry_count);
                tracing::info!(
                    notification_id = %notification.id,
                    retry_count = updated.retry_count,
                    "send failed, retrying in {:?}: {}",
                    delay,
                    error,
                );
                self.scheduler
                    .schedule(Job::Requeue(notification.id.clone()), delay);
                return Ok(());
            }
            // Budget spent, fall through.
        }

        tracing::warn!(notification_id = %notification.id, "send failed permanently: {}", error);
        self.store.mark_failed(&notification.id, &error).await?;
        Ok(())
    }

    fn retry_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 16) as u32;
        let seconds = self
            .config
            .dispatch
            .retry_base_seconds
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.config.dispatch.retry_max_backoff_seconds);
        Duration::from_secs(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_base(base: u64, cap: u64) -> WorkerPool {
        let mut config = Config::default();
        config.dispatch.retry_base_seconds = base;
        config.dispatch.retry_max_backoff_seconds = cap;
        let store = Store::new(sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        WorkerPool::new(
            store,
            Arc::new(PriorityQueue::new(4)),
            Arc::new(ProviderRegistry::new()),
            Arc::new(Scheduler::new()),
            config,
        )
    }

    #[tokio::test]
    async fn retry_delay_doubles_per_attempt() {
        let pool = pool_with_base(5, 900);

        assert_eq!(pool.retry_delay(1), Duration::from_secs(10));
        assert_eq!(pool.retry_delay(2), Duration::from_secs(20));
        assert_eq!(pool.retry_delay(3), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn retry_delay_is_capped() {
        let pool = pool_with_base(5, 900);

        assert_eq!(pool.retry_delay(8), Duration::from_secs(900));
        // Large counts must not overflow.
        assert_eq!(pool.retry_delay(i32::MAX), Duration::from_secs(900));
    }
}
