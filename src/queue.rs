//! Bounded request queue, active only when every route in a chain has its
//! breaker open.
//!
//! No direct teacher analog — modeled after the event-driven worker shape
//! the teacher uses for its config watcher (`main.rs`'s `config_watcher`
//! poll loop), but woken by `tokio::sync::Notify` rather than a fixed
//! interval so the dequeue worker doesn't busy-poll faster than
//! `retry_delay_ms` needs it to.
//!
//! A single background task (`main::queue_worker`) owns draining this queue:
//! on every notify or `retry_delay_ms` tick it calls [`RequestQueue::try_dequeue`]
//! until empty, which retires each item's slot and wakes its waiter so the
//! waiter can re-check breaker admission. Without that worker, enqueued items
//! would only ever be retired by the caller's own deadline, never freeing a
//! slot early once a breaker recovers.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, Notify};
use uuid::Uuid;

use crate::config::QueueConfig;

#[derive(Clone)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub client_id: String,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

/// A successfully enqueued item plus the channel the background dequeue
/// worker uses to wake its waiter. Not `Clone` — only `QueuedRequest` lives
/// in the internal FIFO, this pairs it with the one-shot half the caller
/// actually awaits on.
pub struct EnqueuedRequest {
    pub item: QueuedRequest,
    pub woken: oneshot::Receiver<()>,
}

pub enum EnqueueResult {
    Enqueued(EnqueuedRequest),
    Full,
    ClientShareExceeded,
}

struct Inner {
    items: VecDeque<QueuedRequest>,
    per_client_counts: HashMap<String, usize>,
}

pub struct RequestQueue {
    cfg: QueueConfig,
    inner: Mutex<Inner>,
    wakers: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    pub notify: Notify,
}

impl RequestQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner { items: VecDeque::new(), per_client_counts: HashMap::new() }),
            wakers: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.cfg.max_wait_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.cfg.retry_delay_ms)
    }

    /// Per-attempt retry cap: how many times a waiter may re-enqueue after
    /// being woken and finding every target still refused, before giving up.
    pub fn max_retries(&self) -> u32 {
        self.cfg.max_retries
    }

    /// Attempt to enqueue a request for `client_id`.
    ///
    /// Fair share: a client may hold at most `max_size / distinct_clients`
    /// slots, computed against the distinct-client count including this
    /// arrival, so a single noisy client can't starve the others.
    pub async fn try_enqueue(&self, client_id: &str) -> EnqueueResult {
        let mut inner = self.inner.lock().await;

        if inner.items.len() >= self.cfg.max_size {
            return EnqueueResult::Full;
        }

        let distinct_clients = inner.per_client_counts.len().max(1)
            + if inner.per_client_counts.contains_key(client_id) { 0 } else { 1 };
        let fair_share = (self.cfg.max_size / distinct_clients).max(1);
        let current = inner.per_client_counts.get(client_id).copied().unwrap_or(0);
        if current >= fair_share {
            return EnqueueResult::ClientShareExceeded;
        }

        let now = Instant::now();
        let item = QueuedRequest {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            enqueued_at: now,
            deadline: now + self.max_wait(),
        };

        *inner.per_client_counts.entry(client_id.to_string()).or_insert(0) += 1;
        inner.items.push_back(item.clone());
        drop(inner);

        let (tx, rx) = oneshot::channel();
        self.wakers.lock().await.insert(item.id, tx);
        self.notify.notify_one();

        EnqueueResult::Enqueued(EnqueuedRequest { item, woken: rx })
    }

    /// Remove and return the oldest non-expired item, waking its waiter via
    /// the one-shot channel stored for it in [`try_enqueue`]. Expired items
    /// are dropped (counted as `queue_timeout` by the caller, which times out
    /// independently on the same deadline) as they're encountered.
    pub async fn try_dequeue(&self) -> Option<QueuedRequest> {
        let mut inner = self.inner.lock().await;
        while let Some(item) = inner.items.pop_front() {
            if let Some(count) = inner.per_client_counts.get_mut(&item.client_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_client_counts.remove(&item.client_id);
                }
            }
            let waker = self.wakers.lock().await.remove(&item.id);
            if item.deadline > Instant::now() {
                if let Some(tx) = waker {
                    let _ = tx.send(());
                }
                return Some(item);
            }
            // Expired while queued — drop silently, caller already timed out.
        }
        None
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_size: usize, max_wait_secs: u64) -> QueueConfig {
        QueueConfig {
            enabled: true,
            max_size,
            max_wait_secs,
            retry_delay_ms: 10,
            max_retries: 3,
            global_fallback_tier: None,
        }
    }

    #[tokio::test]
    async fn enqueues_up_to_max_size() {
        let q = RequestQueue::new(cfg(2, 30));
        assert!(matches!(q.try_enqueue("a").await, EnqueueResult::Enqueued(_)));
        assert!(matches!(q.try_enqueue("b").await, EnqueueResult::Enqueued(_)));
        assert!(matches!(q.try_enqueue("c").await, EnqueueResult::Full));
    }

    #[tokio::test]
    async fn max_size_zero_behaves_as_breaker_only() {
        let q = RequestQueue::new(cfg(0, 30));
        assert!(matches!(q.try_enqueue("a").await, EnqueueResult::Full));
    }

    #[tokio::test]
    async fn fair_share_limits_single_client_when_others_present() {
        let q = RequestQueue::new(cfg(4, 30));
        // First arrival from "a" alone: fair_share = max(4/1, 1) = 4, allowed.
        assert!(matches!(q.try_enqueue("a").await, EnqueueResult::Enqueued(_)));
        // Second arrival from "b": now 2 distinct clients, fair_share = 4/2 = 2.
        assert!(matches!(q.try_enqueue("b").await, EnqueueResult::Enqueued(_)));
        assert!(matches!(q.try_enqueue("a").await, EnqueueResult::Enqueued(_)));
        // "a" now holds 2 of 2 fair share slots.
        assert!(matches!(q.try_enqueue("a").await, EnqueueResult::ClientShareExceeded));
    }

    #[tokio::test]
    async fn dequeue_returns_fifo_order() {
        let q = RequestQueue::new(cfg(10, 30));
        q.try_enqueue("a").await;
        q.try_enqueue("b").await;
        let first = q.try_dequeue().await.unwrap();
        assert_eq!(first.client_id, "a");
        let second = q.try_dequeue().await.unwrap();
        assert_eq!(second.client_id, "b");
    }

    #[tokio::test]
    async fn expired_items_are_skipped_on_dequeue() {
        let q = RequestQueue::new(cfg(10, 0));
        q.try_enqueue("a").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(q.try_dequeue().await.is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_the_enqueued_waiter() {
        let q = RequestQueue::new(cfg(10, 30));
        let handle = match q.try_enqueue("a").await {
            EnqueueResult::Enqueued(h) => h,
            _ => panic!("expected Enqueued"),
        };
        assert!(q.try_dequeue().await.is_some());
        handle.woken.await.expect("waker fired on dequeue");
    }
}
