//! Rate-limited work queue and worker dispatch loop
//!
//! One generic queue replaces the per-event-class queue/worker boilerplate:
//! the same `WorkQueue<T>` is instantiated once per event class and
//! `run_worker` is parameterized by the handler function.
//!
//! Guarantees, matching the informer work queue contract the handlers rely
//! on:
//!  - duplicate adds of a key coalesce into a single delivery,
//!  - a key is never processed by two workers concurrently (single-flight),
//!  - a key re-added while in flight is redelivered only after `done`,
//!  - `add_rate_limited` delays redelivery with per-key exponential backoff,
//!    reset by `forget`,
//!  - `shut_down` wakes blocked getters and discards pending items.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::controller::outcome::Outcome;
use crate::Result;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// A named, rate-limited work queue of reconciliation keys.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    name: &'static str,
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Keys waiting for delivery (queued or pending redelivery after done).
    dirty: HashSet<T>,
    /// Keys currently held by a worker.
    processing: HashSet<T>,
    /// Consecutive failures per key, driving the backoff schedule.
    failures: HashMap<T, u32>,
    shutdown: bool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn named(name: &'static str) -> Self {
        Self::with_backoff(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(name: &'static str, base_delay: Duration, max_delay: Duration) -> Self {
        WorkQueue {
            inner: Arc::new(Inner {
                name,
                base_delay,
                max_delay,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueue a key for immediate delivery. Duplicate adds coalesce; a key
    /// currently in flight is marked dirty and redelivered after `done`.
    pub fn add(&self, item: T) {
        {
            let mut state = self.lock();
            if state.shutdown {
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
        self.inner.notify.notify_one();
    }

    /// Enqueue a key after the backoff delay for its failure count.
    ///
    /// The first add for a key waits the base delay; each subsequent one
    /// doubles it up to the cap, until `forget` resets the count.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            let attempts = state.failures.entry(item.clone()).or_insert(0);
            *attempts += 1;
            backoff_delay(self.inner.base_delay, self.inner.max_delay, *attempts)
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Dequeue the next key, waiting until one arrives or the queue shuts
    /// down. Returns `None` on shutdown; pending items are discarded.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release the queue slot for a key. Must be called exactly once per
    /// `get`; redelivers the key if it went dirty while in flight.
    pub fn done(&self, item: &T) {
        let redeliver = {
            let mut state = self.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutdown {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.inner.notify.notify_one();
        }
    }

    /// Clear the failure count for a key, resetting its backoff schedule.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    /// Stop the queue: wake blocked getters, reject further adds, drop
    /// pending items without processing them.
    pub fn shut_down(&self) {
        self.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.inner.state.lock().expect("work queue state poisoned")
    }
}

fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Worker dispatch loop: pull keys off the queue and run the handler until
/// shutdown.
///
/// This is the sole retry decision point. A successful pass forgets the
/// key's backoff history; a failed one re-enqueues with the rate-limited
/// schedule. The queue slot is always released so redelivery can happen.
pub async fn run_worker<F, Fut>(queue: WorkQueue<String>, handler: F)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Outcome>>,
{
    while let Some(key) = queue.get().await {
        match handler(key.clone()).await {
            Ok(outcome) => {
                queue.forget(&key);
                info!(queue = queue.name(), %key, reason = outcome.reason(), "{outcome}");
            }
            Err(error) => {
                warn!(queue = queue.name(), %key, %error, "sync failed, requeuing with backoff");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(queue = queue.name(), "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{timeout, Instant};

    fn queue() -> WorkQueue<String> {
        WorkQueue::named("test")
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_redelivered_after_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        // Re-added while processing: must not become visible until done.
        q.add("a".to_string());
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getter() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        let got = timeout(Duration::from_secs(1), getter)
            .await
            .expect("getter did not wake")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn shutdown_discards_pending_items() {
        let q = queue();
        q.add("a".to_string());
        q.shut_down();
        assert!(q.get().await.is_none());
        q.add("b".to_string());
        assert!(q.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_delay_doubles_until_forget() {
        let q = WorkQueue::with_backoff(
            "test",
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        q.add_rate_limited("a".to_string());
        let start = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        let first = start.elapsed();
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
        q.done(&"a".to_string());

        q.add_rate_limited("a".to_string());
        let start = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        let second = start.elapsed();
        assert!(second >= Duration::from_millis(20) && second < Duration::from_millis(40));
        q.done(&"a".to_string());

        q.forget(&"a".to_string());
        q.add_rate_limited("a".to_string());
        let start = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        let reset = start.elapsed();
        assert!(reset >= Duration::from_millis(10) && reset < Duration::from_millis(20));
        q.done(&"a".to_string());
    }

    #[test]
    fn backoff_delay_caps_at_max() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(5));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(20));
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[tokio::test]
    async fn worker_loop_retries_failed_keys_with_backoff() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));

        q.add("a".to_string());
        let worker = {
            let q = q.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                run_worker(q, move |_key| {
                    let calls = Arc::clone(&calls);
                    async move {
                        // First invocation fails, second succeeds.
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(crate::Error::ConfigError("transient".to_string()))
                        } else {
                            Ok(Outcome::Unchanged)
                        }
                    }
                })
                .await;
            })
        };

        // The failed pass re-enqueues with backoff, so the worker runs the
        // handler a second time before we stop it.
        timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler was not retried");

        q.shut_down();
        timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not exit on shutdown")
            .unwrap();
    }
}
