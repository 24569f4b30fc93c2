//! One-shot timer service for deferred work: retry re-enqueues and
//! delivery confirmations.
//!
//! A single ticker sweeps a min-heap keyed by fire time, so thousands of
//! pending timers cost O(log n) per insertion and O(k) per tick for the k
//! due entries. Jobs fire into the store/queue; both handlers are
//! idempotent, so a job that races a competing state change degrades to a
//! no-op.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::DispatchConfig;
use crate::queue::{PriorityQueue, QueueItem};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Retrying → Pending and back into the queue.
    Requeue(String),
    /// Sent → Delivered, unless the row has moved on.
    ConfirmDelivery(String),
}

struct Entry {
    fire_at: Instant,
    // Tie-breaker keeping same-instant jobs FIFO.
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap max-heap yields the earliest fire time.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn schedule(&self, job: Job, delay: Duration) {
        self.schedule_at(job, Instant::now() + delay);
    }

    pub fn schedule_at(&self, job: Job, fire_at: Instant) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap
            .lock()
            .expect("scheduler lock poisoned")
            .push(Entry { fire_at, seq, job });
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("scheduler lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_due(&self, now: Instant) -> Vec<Job> {
        let mut heap = self.heap.lock().expect("scheduler lock poisoned");
        let mut due = Vec::new();
        while let Some(entry) = heap.peek() {
            if entry.fire_at > now {
                break;
            }
            due.push(heap.pop().expect("peeked entry vanished").job);
        }
        due
    }

    /// Ticker loop: sweep due jobs every `scheduler_tick` until shutdown.
    pub async fn run(
        self: Arc<Self>,
        store: Store,
        queue: Arc<PriorityQueue>,
        config: DispatchConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("scheduler shutting down with {} pending timers", self.len());
                    break;
                }
                _ = tokio::time::sleep(config.scheduler_tick) => {}
            }

            for job in self.pop_due(Instant::now()) {
                self.fire(&store, &queue, job).await;
            }
        }
    }

    async fn fire(&self, store: &Store, queue: &PriorityQueue, job: Job) {
        match job {
            Job::Requeue(id) => match store.release_retry(&id).await {
                Ok(Some(notification)) => {
                    if let Err(error) = queue
                        .enqueue(QueueItem {
                            id: notification.id.clone(),
                            priority: notification.priority,
                        })
                        .await
                    {
                        tracing::warn!(notification_id = %notification.id, "failed to re-enqueue retry: {}", error);
                    }
                }
                Ok(None) => {
                    tracing::debug!(notification_id = %id, "retry fired but row is no longer retrying");
                }
                Err(error) => {
                    tracing::warn!(notification_id = %id, "retry release failed, rescheduling: {}", error);
                    self.schedule(Job::Requeue(id), Duration::from_secs(5));
                }
            },
            Job::ConfirmDelivery(id) => match store.confirm_delivered(&id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(notification_id = %id, "confirmation fired but row is no longer sent");
                }
                Err(error) => {
                    tracing::warn!(notification_id = %id, "delivery confirmation failed, rescheduling: {}", error);
                    self.schedule(Job::ConfirmDelivery(id), Duration::from_secs(5));
                }
            },
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pops_only_due_entries_in_fire_order() {
        let scheduler = Scheduler::new();
        let start = Instant::now();

        scheduler.schedule_at(
            Job::Requeue("late".to_string()),
            start + Duration::from_secs(30),
        );
        scheduler.schedule_at(
            Job::Requeue("soon".to_string()),
            start + Duration::from_secs(5),
        );
        scheduler.schedule_at(
            Job::Requeue("now".to_string()),
            start + Duration::from_secs(1),
        );

        assert!(scheduler.pop_due(start).is_empty());

        let due = scheduler.pop_due(start + Duration::from_secs(10));
        assert_eq!(
            due,
            vec![
                Job::Requeue("now".to_string()),
                Job::Requeue("soon".to_string()),
            ]
        );
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_instant_jobs_fire_in_insertion_order() {
        let scheduler = Scheduler::new();
        let at = Instant::now() + Duration::from_secs(1);

        for name in ["a", "b", "c"] {
            scheduler.schedule_at(Job::ConfirmDelivery(name.to_string()), at);
        }

        let due = scheduler.pop_due(at);
        assert_eq!(
            due,
            vec![
                Job::ConfirmDelivery("a".to_string()),
                Job::ConfirmDelivery("b".to_string()),
                Job::ConfirmDelivery("c".to_string()),
            ]
        );
    }
}
