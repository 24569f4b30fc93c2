//! In-memory priority queue feeding the worker pool.
//!
//! Three bounded FIFO lanes: `high` (Critical and High), `normal`, `low`.
//! Dequeue order is strict priority, high lane drains first; within a lane
//! order is FIFO. Starvation of the low lane under sustained high-priority
//! load is accepted and surfaced through `depth_of`.
//!
//! The queue holds only {id, priority} snapshots; workers re-read the row
//! from the store before acting, so a queue entry whose notification has
//! since been cancelled or deleted is dropped harmlessly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, Notify};

use crate::db::models::NotificationPriority;
use crate::error::{AppError, AppResult};

/// Lightweight routing snapshot handed to the queue at intake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    High,
    Normal,
    Low,
}

impl From<NotificationPriority> for PriorityClass {
    fn from(priority: NotificationPriority) -> Self {
        match priority {
            NotificationPriority::Critical | NotificationPriority::High => PriorityClass::High,
            NotificationPriority::Normal => PriorityClass::Normal,
            NotificationPriority::Low => PriorityClass::Low,
        }
    }
}

struct Lane {
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<mpsc::Receiver<QueueItem>>,
    depth: AtomicUsize,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }
}

pub struct PriorityQueue {
    // Index order is the dequeue scan order.
    lanes: [Lane; 3],
    readable: Notify,
    idle_wait: Duration,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: [
                Lane::new(capacity),
                Lane::new(capacity),
                Lane::new(capacity),
            ],
            readable: Notify::new(),
            idle_wait: Duration::from_millis(100),
        }
    }

    fn lane(&self, class: PriorityClass) -> &Lane {
        match class {
            PriorityClass::High => &self.lanes[0],
            PriorityClass::Normal => &self.lanes[1],
            PriorityClass::Low => &self.lanes[2],
        }
    }

    /// Enqueue with backpressure: awaits lane capacity.
    pub async fn enqueue(&self, item: QueueItem) -> AppResult<()> {
        let lane = self.lane(item.priority.into());
        lane.tx
            .send(item)
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("queue lane closed")))?;
        lane.depth.fetch_add(1, Ordering::Relaxed);
        self.readable.notify_one();
        Ok(())
    }

    /// Non-blocking enqueue for the load-shedding intake path.
    pub fn try_enqueue(&self, item: QueueItem) -> AppResult<()> {
        let lane = self.lane(item.priority.into());
        match lane.tx.try_send(item) {
            Ok(()) => {
                lane.depth.fetch_add(1, Ordering::Relaxed);
                self.readable.notify_one();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(AppError::QueueOverloaded),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AppError::Internal(anyhow::anyhow!("queue lane closed")))
            }
        }
    }

    /// Single pass over the lanes in priority order.
    pub async fn try_dequeue(&self) -> Option<QueueItem> {
        for lane in &self.lanes {
            let mut rx = lane.rx.lock().await;
            if let Ok(item) = rx.try_recv() {
                lane.depth.fetch_sub(1, Ordering::Relaxed);
                return Some(item);
            }
        }
        None
    }

    /// Blocking dequeue: scans high→normal→low, parks on readiness when all
    /// lanes are empty, re-checks in the same order on wakeup. Errors with
    /// `Cancelled` once shutdown is signalled.
    pub async fn dequeue(&self, shutdown: &mut broadcast::Receiver<()>) -> AppResult<QueueItem> {
        loop {
            if let Some(item) = self.try_dequeue().await {
                return Ok(item);
            }

            tokio::select! {
                _ = self.readable.notified() => {}
                // Notify wakeups can race a competing consumer; the tick
                // bounds the wait either way.
                _ = tokio::time::sleep(self.idle_wait) => {}
                _ = shutdown.recv() => return Err(AppError::Cancelled),
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| lane.depth.load(Ordering::Relaxed))
            .sum()
    }

    pub fn depth_of(&self, class: PriorityClass) -> usize {
        self.lane(class).depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NotificationPriority::*;

    fn item(id: &str, priority: NotificationPriority) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn strict_priority_then_fifo_within_class() {
        let queue = PriorityQueue::new(16);

        for entry in [
            item("L1", Low),
            item("N1", Normal),
            item("N2", Normal),
            item("H1", High),
            item("L2", Low),
        ] {
            queue.enqueue(entry).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(entry) = queue.try_dequeue().await {
            order.push(entry.id);
        }

        assert_eq!(order, vec!["H1", "N1", "N2", "L1", "L2"]);
    }

    #[tokio::test]
    async fn critical_and_high_share_the_front_lane() {
        let queue = PriorityQueue::new(16);

        queue.enqueue(item("H1", High)).await.unwrap();
        queue.enqueue(item("C1", Critical)).await.unwrap();

        // Same lane, FIFO: enqueue order wins, not priority value.
        assert_eq!(queue.try_dequeue().await.unwrap().id, "H1");
        assert_eq!(queue.try_dequeue().await.unwrap().id, "C1");
    }

    #[tokio::test]
    async fn try_enqueue_sheds_when_lane_full() {
        let queue = PriorityQueue::new(2);

        queue.try_enqueue(item("a", Normal)).unwrap();
        queue.try_enqueue(item("b", Normal)).unwrap();

        let err = queue.try_enqueue(item("c", Normal)).unwrap_err();
        assert!(matches!(err, AppError::QueueOverloaded));

        // Other lanes are unaffected by a full normal lane.
        queue.try_enqueue(item("d", Critical)).unwrap();
    }

    #[tokio::test]
    async fn depth_tracks_enqueue_and_dequeue() {
        let queue = PriorityQueue::new(16);

        queue.enqueue(item("a", Critical)).await.unwrap();
        queue.enqueue(item("b", Low)).await.unwrap();

        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.depth_of(PriorityClass::High), 1);
        assert_eq!(queue.depth_of(PriorityClass::Low), 1);

        queue.try_dequeue().await.unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(PriorityQueue::new(16));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let _keep = shutdown_tx;

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(&mut shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(item("late", Normal)).await.unwrap();

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.id, "late");
    }

    #[tokio::test]
    async fn dequeue_cancels_on_shutdown() {
        let queue = PriorityQueue::new(16);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        shutdown_tx.send(()).unwrap();

        let err = queue.dequeue(&mut shutdown_rx).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}
