//! Deduplicating, rate-limited work queue.
//!
//! An item is held at most once in the queue and is handed to at most one
//! worker at a time: adding an item that is already being processed marks it
//! dirty, and `done` puts it back so it is processed again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct RateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> RateLimiter<T>
where
    T: Clone + Eq + Hash,
{
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the item should be retried; counts one more failure.
    pub fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        backoff(self.base, self.max, exp)
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    pub fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }
}

fn backoff(base: Duration, max: Duration, exp: u32) -> Duration {
    2u32.checked_pow(exp)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

struct State<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed, whether queued or parked behind an
    /// in-flight run of the same item.
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: RateLimiter<T>,
}

/// Work queue shared by the event handlers and the worker pool.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: RateLimiter::new(base_delay, max_delay),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an item unless it is already waiting.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            // Re-queued by `done`.
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark an item as processed. If it was added again in the meantime it
    /// goes back on the queue.
    pub fn done(&self, item: T) {
        let mut state = self.state();
        state.processing.remove(&item);
        if state.dirty.contains(&item) {
            state.queue.push_back(item);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue the item after its backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Reset the failure count of an item.
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Stop accepting items. Waiting workers drain what is left, then stop.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1000))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff(base, max, 1), Duration::from_millis(10));
        assert_eq!(backoff(base, max, 4), Duration::from_millis(80));
        assert_eq!(backoff(base, max, 40), max);
        assert_eq!(backoff(base, max, u32::MAX), max);
    }

    #[test]
    fn test_rate_limiter_counts_and_forgets() {
        let limiter = RateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 0);
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = queue();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
    }

    #[tokio::test]
    async fn test_in_flight_item_is_coalesced() {
        let queue = queue();
        queue.add("a");
        let item = queue.get().await.unwrap();

        // Added twice while processing: parked, not queued.
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("late");
        assert_eq!(consumer.await.unwrap(), Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let queue = queue();
        queue.add("a");
        queue.shut_down();
        queue.add("ignored");

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, None);
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_workers() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_delays() {
        let queue = queue();
        queue.add_rate_limited("a");
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&"a"), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.get().await, Some("a"));
    }
}
