/*
 * Copyright (C) 2024 The Deploycontrol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// De-duplicating, rate-limited queue of `namespace/name` keys.
///
/// Adding a key that is already queued coalesces into a single delivery, and
/// a key is handed to at most one worker at a time: re-adds while the key is
/// processing are parked in the dirty set and redelivered once the worker
/// calls [`WorkQueue::done`].
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

struct WorkQueueInner {
    state: Mutex<WorkQueueState>,
    failures: Mutex<HashMap<String, u32>>,
    notify: Notify,
}

struct WorkQueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(WorkQueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                failures: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues a key for immediate processing. Idempotent while the key is
    /// already queued or processing.
    pub fn add(&self, key: &str) {
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(key.to_string()) {
                return;
            }
            if state.processing.contains(key) {
                // Redelivered from the dirty set once done() runs.
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.inner.notify.notify_one();
    }

    /// Re-enqueues a key after an exponential backoff derived from its
    /// consecutive-failure count.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.next_backoff(key);
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.lock_failures();
        let attempts = failures.entry(key.to_string()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let exponent = attempts.saturating_sub(1).min(16);
        let millis = BACKOFF_INITIAL_MS
            .saturating_mul(1u64 << exponent)
            .min(BACKOFF_MAX_MS);
        Duration::from_millis(millis)
    }

    /// Clears the failure count after a successful reconcile.
    pub fn forget(&self, key: &str) {
        self.lock_failures().remove(key);
    }

    /// Consecutive rate-limited re-adds recorded for the key.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock_failures().get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key, or `None` once the queue shuts down and the
    /// backlog is drained. The delivered key is held in the processing set
    /// until [`WorkQueue::done`] releases it.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Another worker may be waiting on a remaining item.
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Releases the processing slot; a key re-added while processing is
    /// moved back into the queue here.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock_state();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting new keys and wakes every waiting worker; `get` keeps
    /// draining the existing backlog before reporting shutdown.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock_state();
            state.shutting_down = true;
        }
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock_state().queue.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WorkQueueState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        match self.inner.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Queue that releases keys only after a caller-specified delay has elapsed.
///
/// A key may be scheduled more than once; the earliest deadline fires first
/// and consumers must tolerate repeated delivery. Firing is best-effort
/// wall-clock, not a strict ordering guarantee.
#[derive(Clone)]
pub struct DelayQueue {
    inner: Arc<DelayQueueInner>,
}

struct DelayQueueInner {
    state: Mutex<DelayQueueState>,
    notify: Notify,
}

struct DelayQueueState {
    waiting: BinaryHeap<DelayedKey>,
    shutting_down: bool,
}

struct DelayedKey {
    ready_at: Instant,
    key: String,
}

impl PartialEq for DelayedKey {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.key == other.key
    }
}

impl Eq for DelayedKey {}

impl PartialOrd for DelayedKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline sits at the top of the max-heap.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DelayQueueInner {
                state: Mutex::new(DelayQueueState {
                    waiting: BinaryHeap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Schedules release of the key once `delay` has elapsed.
    pub fn add_after(&self, key: &str, delay: Duration) {
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                return;
            }
            state.waiting.push(DelayedKey {
                ready_at: Instant::now() + delay,
                key: key.to_string(),
            });
        }
        self.inner.notify.notify_one();
    }

    /// Waits until the earliest scheduled key becomes due and returns it, or
    /// `None` once the queue has shut down. Keys whose timers have not fired
    /// by shutdown are discarded.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock_state();
                if state.shutting_down {
                    return None;
                }
                match state.waiting.peek() {
                    Some(entry) if entry.ready_at <= Instant::now() => {
                        let entry = state.waiting.pop();
                        if !state.waiting.is_empty() {
                            self.inner.notify.notify_one();
                        }
                        return entry.map(|item| item.key);
                    }
                    Some(entry) => Some(entry.ready_at),
                    None => None,
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn shut_down(&self) {
        {
            let mut state = self.lock_state();
            state.shutting_down = true;
        }
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.lock_state().waiting.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DelayQueueState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn repeated_adds_coalesce_into_one_delivery() {
        let queue = WorkQueue::new();
        for _ in 0..5 {
            queue.add("default/demo");
        }
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.expect("queued key");
        assert_eq!(key, "default/demo");
        queue.done(&key);

        queue.shut_down();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn add_during_processing_redelivers_after_done() {
        let queue = WorkQueue::new();
        queue.add("default/demo");

        let key = queue.get().await.expect("first delivery");
        // Re-added while a worker holds the key: parked, not queued.
        queue.add("default/demo");
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        let redelivered = timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("redelivery timeout")
            .expect("redelivered key");
        assert_eq!(redelivered, "default/demo");
        queue.done(&redelivered);
    }

    #[tokio::test]
    async fn different_keys_are_delivered_independently() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        queue.add("default/b");

        let first = queue.get().await.expect("first key");
        let second = queue.get().await.expect("second key");
        assert_ne!(first, second);
        queue.done(&first);
        queue.done(&second);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_exponentially() {
        let queue = WorkQueue::new();

        queue.add_rate_limited("default/demo");
        assert_eq!(queue.num_requeues("default/demo"), 1);

        let key = timeout(Duration::from_secs(5), queue.get())
            .await
            .expect("backoff delivery timeout")
            .expect("backoff delivery");
        queue.done(&key);

        queue.add_rate_limited("default/demo");
        queue.add_rate_limited("default/demo");
        assert_eq!(queue.num_requeues("default/demo"), 3);

        queue.forget("default/demo");
        assert_eq!(queue.num_requeues("default/demo"), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_backlog_before_stopping_workers() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        queue.shut_down();

        // Backlog is still delivered; only then does get report shutdown.
        let key = queue.get().await.expect("drained key");
        assert_eq!(key, "default/a");
        queue.done(&key);
        assert_eq!(queue.get().await, None);

        // Adds after shutdown are dropped.
        queue.add("default/b");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getter() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        let delivered = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timeout")
            .expect("waiter join");
        assert_eq!(delivered, None);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_queue_releases_after_the_delay() {
        let queue = DelayQueue::new();
        queue.add_after("default/demo", Duration::from_millis(250));
        assert_eq!(queue.pending(), 1);

        let started = Instant::now();
        let key = queue.get().await.expect("released key");
        assert_eq!(key, "default/demo");
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_fires_first() {
        let queue = DelayQueue::new();
        queue.add_after("default/slow", Duration::from_millis(500));
        queue.add_after("default/fast", Duration::from_millis(100));

        let first = queue.get().await.expect("first release");
        let second = queue.get().await.expect("second release");
        assert_eq!(first, "default/fast");
        assert_eq!(second, "default/slow");
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_a_key_delivers_it_repeatedly() {
        let queue = DelayQueue::new();
        queue.add_after("default/demo", Duration::from_millis(100));
        queue.add_after("default/demo", Duration::from_millis(200));

        assert_eq!(queue.get().await.as_deref(), Some("default/demo"));
        assert_eq!(queue.get().await.as_deref(), Some("default/demo"));
    }

    #[tokio::test]
    async fn delay_queue_shutdown_unblocks_the_worker() {
        let queue = DelayQueue::new();
        queue.add_after("default/demo", Duration::from_secs(3600));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        let delivered = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timeout")
            .expect("waiter join");
        assert_eq!(delivered, None);
    }
}
