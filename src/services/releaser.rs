//! Scheduled releaser: promotes future-dated notifications into the queue
//! once due, and sweeps Processing rows abandoned by a dead worker back to
//! Pending.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::sync::broadcast;

use crate::config::DispatchConfig;
use crate::db::now_utc;
use crate::db::repository::NotificationRepository;
use crate::error::AppResult;
use crate::queue::{PriorityQueue, QueueItem};
use crate::store::{ReclaimOutcome, Store};

const SCAN_BATCH: i64 = 500;

pub struct ScheduledReleaser {
    store: Store,
    queue: Arc<PriorityQueue>,
    config: DispatchConfig,
}

impl ScheduledReleaser {
    pub fn new(store: Store, queue: Arc<PriorityQueue>, config: DispatchConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval = ?self.config.releaser_interval,
            "scheduled releaser started"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.config.releaser_interval) => {}
            }

            if let Err(error) = self.promote_due().await {
                tracing::warn!("scheduled release scan failed: {}", error);
            }
            if let Err(error) = self.sweep_stuck().await {
                tracing::warn!("stuck-processing sweep failed: {}", error);
            }
        }
        tracing::info!("scheduled releaser stopped");
    }

    /// Promote due scheduled notifications. The `mark_queued` guard claims
    /// each row exactly once; the enqueue applies backpressure rather than
    /// shedding, a scheduled send has already been charged.
    pub async fn promote_due(&self) -> AppResult<usize> {
        let now = now_utc();
        let due = NotificationRepository::due_scheduled(self.store.pool(), now, SCAN_BATCH).await?;

        let mut promoted = 0;
        for notification in due {
            let Some(claimed) =
                NotificationRepository::mark_queued(self.store.pool(), &notification.id, now)
                    .await?
            else {
                continue;
            };

            self.queue
                .enqueue(QueueItem {
                    id: claimed.id.clone(),
                    priority: claimed.priority,
                })
                .await?;
            promoted += 1;
            tracing::debug!(notification_id = %claimed.id, "scheduled notification released");
        }

        if promoted > 0 {
            tracing::info!(promoted, "released due scheduled notifications");
        }
        Ok(promoted)
    }

    /// Reclaim rows stuck in Processing past the cutoff: back to Pending
    /// with the attempt counted, or Failed when the budget is spent.
    pub async fn sweep_stuck(&self) -> AppResult<usize> {
        let cutoff = now_utc()
            - ChronoDuration::from_std(self.config.stuck_processing_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let stuck =
            NotificationRepository::stuck_processing(self.store.pool(), cutoff, SCAN_BATCH).await?;

        let mut reclaimed = 0;
        for notification in stuck {
            match self.store.reclaim_stuck(&notification.id).await? {
                ReclaimOutcome::Requeued => {
                    self.queue
                        .enqueue(QueueItem {
                            id: notification.id.clone(),
                            priority: notification.priority,
                        })
                        .await?;
                    reclaimed += 1;
                    tracing::warn!(notification_id = %notification.id, "reclaimed stuck notification");
                }
                ReclaimOutcome::Failed => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        "stuck notification failed, retries exhausted"
                    );
                }
                ReclaimOutcome::Lost => {}
            }
        }
        Ok(reclaimed)
    }
}
