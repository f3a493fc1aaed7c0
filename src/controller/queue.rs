//! Work queue feeding the pilot reconciler
//!
//! A FIFO queue of object keys with at-most-one-pending-entry-per-key
//! deduplication. Multiple producers (watch callbacks, scheduled resyncs)
//! add keys concurrently; a single worker drains them. Failed keys are
//! re-added with per-key exponential rate-limited backoff, which can
//! reorder delivery relative to arrival.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

/// Base delay for the first rate-limited requeue of a key
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Cap on the rate-limited requeue delay
const BACKOFF_MAX: Duration = Duration::from_secs(300);

struct Inner {
    queue: VecDeque<String>,
    pending: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating FIFO work queue with rate-limited requeue
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                pending: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Add a key. A key already pending is not added again.
    pub fn add(&self, key: &str) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.shutting_down || inner.pending.contains(key) {
                return;
            }
            inner.pending.insert(key.to_string());
            inner.queue.push_back(key.to_string());
        }
        self.notify.notify_waiters();
    }

    /// Re-add a key after a failure, delayed by per-key exponential backoff
    /// with jitter. The delayed add runs on its own task so the worker is
    /// never blocked.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.shutting_down {
                return;
            }
            let attempts = inner.failures.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            let exp = BACKOFF_BASE.as_secs_f64() * 2f64.powi((*attempts - 1).min(16) as i32);
            let capped = exp.min(BACKOFF_MAX.as_secs_f64());
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            Duration::from_secs_f64(capped * jitter)
        };

        debug!(key, delay_ms = delay.as_millis(), "Rate-limited requeue");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the failure count for a key after a successful sync
    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.failures.remove(key);
    }

    /// Number of requeue failures currently recorded for a key
    pub fn failures(&self, key: &str) -> u32 {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.failures.get(key).copied().unwrap_or(0)
    }

    /// Await the next key. Returns None once the queue is shut down;
    /// backlogged keys are never delivered after shutdown, only the
    /// caller's in-flight item finishes.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.pending.remove(&key);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Shut the queue down: no new keys are accepted or dequeued.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.shutting_down = true;
        }
        self.notify.notify_waiters();
    }

    /// True once shut down
    pub fn shutting_down(&self) -> bool {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .shutting_down
    }
}
