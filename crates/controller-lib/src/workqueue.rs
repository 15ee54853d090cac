//! Rate-limited, deduplicating workqueue.
//!
//! Semantics match the queue driving upstream Kubernetes controllers:
//! pending items deduplicate, an item being processed is never handed to a
//! second worker (re-adds while in flight are parked and re-queued on
//! `done`), and failed items come back through a rate limiter that is the
//! maximum of a per-item exponential backoff and a global token bucket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);
const BUCKET_QPS: f64 = 50.0;
const BUCKET_BURST: f64 = 300.0;

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shut_down: bool,
}

struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: BUCKET_BURST,
            refilled_at: Instant::now(),
        }
    }

    /// Reserves one token, returning how long the caller must wait for it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * BUCKET_QPS).min(BUCKET_BURST);
        self.refilled_at = now;
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / BUCKET_QPS)
        }
    }
}

pub struct RateLimitingQueue<T> {
    state: Mutex<QueueState<T>>,
    failures: Mutex<HashMap<T, u32>>,
    bucket: Mutex<TokenBucket>,
    notify: Notify,
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shut_down: false,
            }),
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket::new()),
            notify: Notify::new(),
        })
    }

    /// Enqueues an item. No-ops if the identical item is already pending;
    /// items currently in flight are parked and come back after `done`.
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock().expect("workqueue state lock poisoned");
            if state.shut_down {
                return;
            }
            if !state.dirty.insert(item.clone()) {
                return;
            }
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Re-enqueues a failed item after its rate-limited delay.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.next_delay(&item);
        trace!(?item, ?delay, "requeuing with back-off");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Dequeues the next item, waiting until one is available. Returns
    /// `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("workqueue state lock poisoned");
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    // Leave a wakeup behind for the next waiter.
                    if !state.queue.is_empty() || state.shut_down {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shut_down {
                    self.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks an item as processed. If it was re-added while in flight it
    /// goes back on the queue.
    pub fn done(&self, item: &T) {
        let requeue = {
            let mut state = self.state.lock().expect("workqueue state lock poisoned");
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeue {
            self.notify.notify_one();
        }
    }

    /// Clears the item's failure history so future requeues start from the
    /// base delay again.
    pub fn forget(&self, item: &T) {
        self.failures
            .lock()
            .expect("workqueue failure lock poisoned")
            .remove(item);
    }

    pub fn requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .expect("workqueue failure lock poisoned")
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Stops accepting new items and wakes all waiters; pending items drain.
    pub fn shut_down(&self) {
        self.state
            .lock()
            .expect("workqueue state lock poisoned")
            .shut_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("workqueue state lock poisoned")
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Max of the per-item exponential backoff and the global token bucket.
    fn next_delay(&self, item: &T) -> Duration {
        let attempts = {
            let mut failures = self.failures.lock().expect("workqueue failure lock poisoned");
            let entry = failures.entry(item.clone()).or_insert(0);
            let attempts = *entry;
            *entry += 1;
            attempts
        };

        let exponential = Duration::from_secs_f64(
            (BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempts.min(62) as i32))
                .min(BACKOFF_CAP.as_secs_f64()),
        );
        let bucket = self.bucket.lock().expect("workqueue bucket lock poisoned").reserve();

        exponential.max(bucket)
    }
}
