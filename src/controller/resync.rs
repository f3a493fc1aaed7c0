//! Scheduled re-enqueue of Pilot keys
//!
//! Every completed sync schedules its own key again after a fixed delay so
//! peers are continuously re-evaluated even when no watch events arrive.
//! Scheduling the same key again replaces (never stacks) the pending timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::queue::WorkQueue;

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Delay-queue that re-adds keys to the work queue after a duration.
///
/// Safe for concurrent `add`/`forget` from multiple callers; each pending
/// key owns one timer task. Timers carry a generation id: a timer that was
/// replaced while already past its sleep finds a newer generation in the
/// map and backs off instead of firing, so replacement can never
/// double-enqueue a key.
pub struct ScheduledResync {
    queue: Arc<WorkQueue>,
    pending: Arc<Mutex<HashMap<String, PendingTimer>>>,
    generation: AtomicU64,
}

impl ScheduledResync {
    /// Create a scheduler feeding the given work queue
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            queue,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedule exactly one future enqueue of `key` after `delay`,
    /// replacing any previously pending schedule for the same key.
    pub fn add(&self, key: &str, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let pending = Arc::clone(&self.pending);
        let task_key = key.to_string();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // Hold the lock across spawn and insert so the timer body cannot
        // observe the map before its own entry is present.
        let mut map = self.pending.lock().expect("resync lock poisoned");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut map = pending.lock().expect("resync lock poisoned");
                match map.get(&task_key) {
                    Some(timer) if timer.generation == generation => {
                        map.remove(&task_key);
                    }
                    // Replaced or forgotten while sleeping; the newer
                    // timer owns the enqueue.
                    _ => return,
                }
            }
            debug!(key = %task_key, "Resync timer fired");
            queue.add(&task_key);
        });

        if let Some(previous) = map.insert(key.to_string(), PendingTimer { generation, handle }) {
            debug!(key, "Replacing pending resync schedule");
            previous.handle.abort();
        }
    }

    /// Cancel a pending schedule for `key`, if any
    pub fn forget(&self, key: &str) {
        let mut pending = self.pending.lock().expect("resync lock poisoned");
        if let Some(timer) = pending.remove(key) {
            timer.handle.abort();
        }
    }

    /// Number of keys with a pending schedule
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("resync lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_the_delay() {
        let queue = Arc::new(WorkQueue::new());
        let resync = ScheduledResync::new(queue.clone());

        resync.add("db/cass-0", Duration::from_millis(20));
        assert_eq!(resync.pending_count(), 1);

        let key = queue.get().await;
        assert_eq!(key.as_deref(), Some("db/cass-0"));
        assert_eq!(resync.pending_count(), 0);
    }

    #[tokio::test]
    async fn re_adding_replaces_the_pending_schedule() {
        let queue = Arc::new(WorkQueue::new());
        let resync = ScheduledResync::new(queue.clone());

        resync.add("db/cass-0", Duration::from_secs(3600));
        resync.add("db/cass-0", Duration::from_millis(20));
        assert_eq!(resync.pending_count(), 1);

        // The short schedule wins; exactly one enqueue happens.
        let key = queue.get().await;
        assert_eq!(key.as_deref(), Some("db/cass-0"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resync.pending_count(), 0);
    }

    #[tokio::test]
    async fn replacement_at_the_firing_edge_enqueues_once() {
        tokio::time::pause();
        let queue = Arc::new(WorkQueue::new());
        let resync = ScheduledResync::new(queue.clone());

        // Replace a timer just before its deadline; only the replacement
        // may enqueue, and exactly once.
        resync.add("db/cass-0", Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(9)).await;
        resync.add("db/cass-0", Duration::from_millis(30));
        assert_eq!(resync.pending_count(), 1);

        // The replaced timer's deadline passes without an enqueue and
        // without disturbing the pending replacement.
        tokio::time::advance(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(resync.pending_count(), 1);

        tokio::time::advance(Duration::from_millis(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await.as_deref(), Some("db/cass-0"));
        assert_eq!(resync.pending_count(), 0);
    }

    #[tokio::test]
    async fn forget_cancels_a_pending_schedule() {
        let queue = Arc::new(WorkQueue::new());
        let resync = ScheduledResync::new(queue.clone());

        resync.add("db/cass-0", Duration::from_millis(20));
        resync.forget("db/cass-0");
        assert_eq!(resync.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        queue.shut_down();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn distinct_keys_schedule_independently() {
        let queue = Arc::new(WorkQueue::new());
        let resync = ScheduledResync::new(queue.clone());

        resync.add("db/cass-0", Duration::from_millis(10));
        resync.add("db/cass-1", Duration::from_millis(10));
        assert_eq!(resync.pending_count(), 2);

        let mut keys = vec![
            queue.get().await.unwrap(),
            queue.get().await.unwrap(),
        ];
        keys.sort();
        assert_eq!(keys, vec!["db/cass-0", "db/cass-1"]);
    }
}
