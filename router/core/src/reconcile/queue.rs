//! Deduplicating Work Queue
//!
//! FIFO queue of keys with three guarantees the controller relies on:
//!
//! - A key is queued at most once, however often it is added.
//! - A key handed to a worker is not handed to another until [`WorkQueue::done`];
//!   adds that arrive meanwhile are remembered and re-queue it on `done`.
//! - Failed keys come back after a per-key exponential delay
//!   ([`WorkQueue::add_rate_limited`]) until [`WorkQueue::forget`] resets them.
//!
//! # State
//!
//! ```text
//!   add ──► dirty ──► queue ──get──► processing ──done──► (dirty? ──► queue)
//!                                        │
//!                    add while processing└──► dirty only
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::backoff::Backoff;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    // Token of the latest delayed add per key; stale timers are ignored.
    waiting: HashMap<K, u64>,
    next_token: u64,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            waiting: HashMap::new(),
            next_token: 0,
            shutting_down: false,
        }
    }
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

/// Rate-limited, deduplicating FIFO of keys
///
/// Cheap to clone; clones share the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create an empty queue retrying failures with `backoff`
    #[must_use]
    pub fn new(backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queue `key` unless it is already queued
    ///
    /// Ignored after [`Self::shutdown`].
    pub fn add(&self, key: K) {
        let mut state = self.shared.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Queue `key` after `delay`
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let token = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.next_token += 1;
            let token = state.next_token;
            state.waiting.insert(key.clone(), token);
            token
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut state = queue.shared.state.lock();
                if state.waiting.get(&key) == Some(&token) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if current {
                queue.add(key);
            }
        });
    }

    /// Queue `key` after its next backoff delay
    ///
    /// Returns the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let failures = {
            let mut state = self.shared.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let previous = *failures;
            *failures = failures.saturating_add(1);
            previous
        };
        let delay = self.shared.backoff.delay(failures);
        self.add_after(key, delay);
        delay
    }

    /// Reset `key`'s failure count
    pub fn forget(&self, key: &K) {
        self.shared.state.lock().failures.remove(key);
    }

    /// Times `key` has been re-queued through [`Self::add_rate_limited`]
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down. The caller owns the key
    /// until it calls [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    // Pass the wakeup on so idle workers drain the backlog.
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key`; re-queue it if it was added while being processed
    pub fn done(&self, key: &K) {
        let mut state = self.shared.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Drop every pending trace of `key`
    ///
    /// Queued and delayed adds are cancelled and the failure count is reset.
    /// If a worker currently holds `key` it is marked dirty instead, so it is
    /// processed once more after the in-flight run finishes.
    pub fn discard(&self, key: &K) {
        let mut state = self.shared.state.lock();
        state.waiting.remove(key);
        state.failures.remove(key);
        if state.processing.contains(key) {
            if !state.shutting_down {
                state.dirty.insert(key.clone());
            }
            return;
        }
        if state.dirty.remove(key) {
            state.queue.retain(|k| k != key);
        }
    }

    /// Stop handing out keys; waiting workers get `None`
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Whether [`Self::shutdown`] was called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is held by a worker
    #[must_use]
    pub fn is_processing(&self, key: &K) -> bool {
        self.shared.state.lock().processing.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Backoff::new(
            Duration::from_millis(5),
            Duration::from_millis(50),
            0.0,
        ))
    }

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let queue = queue();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let queue = queue();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());
        assert!(queue.is_processing(&"a"));

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("late");
        assert_eq!(waiter.await.unwrap(), Some("late"));
    }

    #[test]
    fn test_get_pends_until_woken() {
        let queue = queue();
        let mut get = tokio_test::task::spawn(queue.get());
        tokio_test::assert_pending!(get.poll());

        queue.add("a");
        assert!(get.is_woken());
        assert_eq!(tokio_test::assert_ready!(get.poll()), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("ignored");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_delay_grows_until_forget() {
        let queue = queue();
        assert_eq!(queue.add_rate_limited("a"), Duration::from_millis(5));
        assert_eq!(queue.add_rate_limited("a"), Duration::from_millis(10));
        assert_eq!(queue.num_requeues(&"a"), 2);

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
        assert_eq!(queue.add_rate_limited("a"), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_delayed_add_arrives() {
        let queue = queue();
        let start = Instant::now();
        queue.add_after("a", Duration::from_millis(20));
        assert!(queue.is_empty());

        let key = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap();
        assert_eq!(key, Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_discard_cancels_pending_work() {
        let queue = queue();
        queue.add("a");
        queue.add("b");
        queue.add_after("c", Duration::from_millis(10));

        queue.discard(&"a");
        queue.discard(&"c");
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("b"));
    }

    #[tokio::test]
    async fn test_discard_while_processing_marks_dirty() {
        let queue = queue();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.discard(&"a");
        queue.done(&key);
        assert_eq!(queue.get().await, Some("a"));
    }
}
