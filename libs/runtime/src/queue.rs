//! Per-key work queue with in-flight tracking.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    inflight: HashSet<K>,
    /// Keys whose events arrived while they were in flight; requeued on
    /// `done` so the newer state supersedes the pass that just ran.
    dirty: HashSet<K>,
    delayed: Vec<(Instant, K)>,
}

/// A work queue that coalesces duplicate keys and guarantees at most one
/// in-flight item per key.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                inflight: HashSet::new(),
                dirty: HashSet::new(),
                delayed: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues a key for processing. Duplicates coalesce; a key in flight
    /// is marked dirty instead. An immediate add cancels a pending delay.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        state.delayed.retain(|(_, k)| *k != key);
        if state.inflight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueues a key after `delay`, unless it is already queued, delayed,
    /// or in flight.
    pub fn add_after(&self, key: K, delay: Duration) {
        let mut state = self.lock();
        if state.queued.contains(&key)
            || state.inflight.contains(&key)
            || state.delayed.iter().any(|(_, k)| *k == key)
        {
            return;
        }
        state.delayed.push((Instant::now() + delay, key));
        drop(state);
        // Wake a waiter so it can recompute its sleep deadline.
        self.notify.notify_one();
    }

    /// Waits for the next key and marks it in flight.
    pub async fn next(&self) -> K {
        loop {
            let deadline = {
                let mut state = self.lock();
                self.promote_due(&mut state);
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.inflight.insert(key.clone());
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return key;
                }
                state.delayed.iter().map(|(at, _)| *at).min()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Marks an in-flight key finished. If events arrived meanwhile the key
    /// is requeued immediately.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.inflight.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Keys currently ready or delayed.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn promote_due(&self, state: &mut QueueState<K>) {
        let now = Instant::now();
        let mut index = 0;
        while index < state.delayed.len() {
            if state.delayed[index].0 <= now {
                let (_, key) = state.delayed.swap_remove(index);
                if !state.inflight.contains(&key) && state.queued.insert(key.clone()) {
                    state.ready.push_back(key);
                }
            } else {
                index += 1;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<K>> {
        self.state.lock().expect("work queue lock poisoned")
    }
}
