//! The controller loop: watch, enqueue, reconcile, retry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tiller_api::{Kind, ObjectKey};
use tiller_store::{ObjectStore, StoreError, WatchEvent, WatchFilter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, RetryTracker};
use crate::queue::WorkQueue;

/// What to do after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileAction {
    pub requeue_after: Option<Duration>,
}

impl ReconcileAction {
    /// Nothing further to do until the next event.
    #[must_use]
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Revisit this key after `delay` even without an event.
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// Errors surfaced by a reconcile pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// State moved underneath the pass. Requeued immediately; the retry
    /// re-reads fresh state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Something temporarily unavailable. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// A bug or unresolvable input. Logged and dropped; the object's
    /// status conditions carry the detail.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            // Any store-level race means our read was stale: retry against
            // fresh state. A vanished or newly-present object falls in the
            // same bucket.
            StoreError::Conflict { .. }
            | StoreError::NotFound(_)
            | StoreError::AlreadyExists(_) => ReconcileError::Conflict(err.to_string()),
            StoreError::Validation(_) => ReconcileError::Fatal(err.to_string()),
        }
    }
}

/// A reconcile function plus the watches that feed it.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name for logging.
    fn name(&self) -> &'static str;

    /// Watch subscriptions whose events feed this controller's queue.
    fn watches(&self) -> Vec<WatchFilter>;

    /// Maps an event to the keys to reconcile. The default reconciles the
    /// event's own object; controllers watching children override this to
    /// map back to the owner.
    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        vec![event.key()]
    }

    /// Drives one object toward its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError>;

    /// Called once when a key exhausts its retry budget. The key keeps
    /// retrying at the capped delay; this hook lets the controller surface
    /// a degraded condition.
    fn on_retries_exhausted(&self, _key: &ObjectKey) {}
}

/// Tuning for a controller loop.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Parallel reconcile workers. Per-key serialization is guaranteed by
    /// the queue regardless of this value.
    pub workers: usize,

    pub backoff: BackoffPolicy,

    /// Consecutive failures before `on_retries_exhausted` fires.
    pub max_attempts: u32,

    /// Periodic full requeue of all matching objects. Catches anything a
    /// missed edge would otherwise leave stranded.
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            backoff: BackoffPolicy::default(),
            max_attempts: 5,
            resync_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Handle to a running controller.
pub struct Controller {
    handle: JoinHandle<()>,
}

impl Controller {
    /// Spawns the controller: one event pump per watch, a resync ticker,
    /// and a pool of reconcile workers. Everything winds down when
    /// `shutdown` flips to true.
    pub fn spawn<R: Reconciler>(
        reconciler: Arc<R>,
        store: ObjectStore,
        options: ControllerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let name = reconciler.name();
        let queue = Arc::new(WorkQueue::new());
        let retries = Arc::new(Mutex::new(RetryTracker::new()));
        let mut tasks = Vec::new();

        info!(
            controller = name,
            workers = options.workers,
            "starting controller"
        );

        for filter in reconciler.watches() {
            tasks.push(tokio::spawn(pump_events(
                Arc::clone(&reconciler),
                store.clone(),
                filter,
                Arc::clone(&queue),
                shutdown.clone(),
            )));
        }

        if let Some(interval) = options.resync_interval {
            tasks.push(tokio::spawn(resync(
                Arc::clone(&reconciler),
                store.clone(),
                interval,
                Arc::clone(&queue),
                shutdown.clone(),
            )));
        }

        for _ in 0..options.workers.max(1) {
            tasks.push(tokio::spawn(run_worker(
                Arc::clone(&reconciler),
                options.clone(),
                Arc::clone(&queue),
                Arc::clone(&retries),
                shutdown.clone(),
            )));
        }

        let handle = tokio::spawn(async move {
            for task in tasks {
                let _ = task.await;
            }
            info!(controller = name, "controller stopped");
        });

        Self { handle }
    }

    /// Waits for the controller to finish shutting down.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn pump_events<R: Reconciler>(
    reconciler: Arc<R>,
    store: ObjectStore,
    filter: WatchFilter,
    queue: Arc<WorkQueue<ObjectKey>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = store.watch(filter, None);
    loop {
        tokio::select! {
            event = stream.next() => {
                for key in reconciler.enqueue_for(&event) {
                    queue.add(key);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn resync<R: Reconciler>(
    reconciler: Arc<R>,
    store: ObjectStore,
    interval: Duration,
    queue: Arc<WorkQueue<ObjectKey>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The watch replay already covers current state at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for filter in reconciler.watches() {
                    for key in keys_for_filter(&store, &filter) {
                        queue.add(key);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn keys_for_filter(store: &ObjectStore, filter: &WatchFilter) -> Vec<ObjectKey> {
    let kinds: Vec<Kind> = match filter.kind {
        Some(kind) => vec![kind],
        None => Kind::ALL.to_vec(),
    };
    let mut keys = Vec::new();
    for kind in kinds {
        for object in store.list(kind, filter.namespace.as_deref(), filter.selector.as_ref()) {
            keys.push(object.key());
        }
    }
    keys
}

async fn run_worker<R: Reconciler>(
    reconciler: Arc<R>,
    options: ControllerOptions,
    queue: Arc<WorkQueue<ObjectKey>>,
    retries: Arc<Mutex<RetryTracker<ObjectKey>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            key = queue.next() => key,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let name = reconciler.name();
        debug!(controller = name, key = %key, "reconciling");

        match reconciler.reconcile(&key).await {
            Ok(action) => {
                retries.lock().expect("retry lock poisoned").clear(&key);
                queue.done(&key);
                if let Some(delay) = action.requeue_after {
                    queue.add_after(key, delay);
                }
            }
            Err(ReconcileError::Conflict(reason)) => {
                debug!(controller = name, key = %key, reason, "conflict, requeueing");
                queue.done(&key);
                queue.add(key);
            }
            Err(ReconcileError::Transient(reason)) => {
                let attempt = retries
                    .lock()
                    .expect("retry lock poisoned")
                    .record_failure(&key);
                warn!(
                    controller = name,
                    key = %key,
                    attempt,
                    reason,
                    "reconcile failed, backing off"
                );
                if attempt == options.max_attempts {
                    reconciler.on_retries_exhausted(&key);
                }
                let delay = options.backoff.delay(attempt);
                queue.done(&key);
                queue.add_after(key, delay);
            }
            Err(ReconcileError::Fatal(reason)) => {
                error!(controller = name, key = %key, reason, "reconcile failed permanently");
                retries.lock().expect("retry lock poisoned").clear(&key);
                queue.done(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tiller_api::{Object, Payload, PodObject, PodSpec};

    fn pod(name: &str) -> Object {
        Object::new(
            "default",
            name,
            Payload::Pod(PodObject {
                spec: PodSpec {
                    image: "registry/web:v1".to_string(),
                    ..PodSpec::default()
                },
                status: Default::default(),
            }),
        )
    }

    struct CountingReconciler {
        reconciles: Mutex<Vec<ObjectKey>>,
        failures_before_success: u32,
        attempts: AtomicU32,
        exhausted: AtomicU32,
    }

    impl CountingReconciler {
        fn new(failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                reconciles: Mutex::new(Vec::new()),
                failures_before_success,
                attempts: AtomicU32::new(0),
                exhausted: AtomicU32::new(0),
            })
        }

        fn seen(&self) -> Vec<ObjectKey> {
            self.reconciles.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn watches(&self) -> Vec<WatchFilter> {
            vec![WatchFilter::kind(Kind::Pod)]
        }

        async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures_before_success {
                return Err(ReconcileError::Transient("not yet".to_string()));
            }
            self.reconciles.lock().unwrap().push(key.clone());
            Ok(ReconcileAction::done())
        }

        fn on_retries_exhausted(&self, _key: &ObjectKey) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn reconciles_each_watched_object() {
        let store = ObjectStore::new();
        let reconciler = CountingReconciler::new(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::spawn(
            Arc::clone(&reconciler),
            store.clone(),
            ControllerOptions {
                resync_interval: None,
                ..ControllerOptions::default()
            },
            shutdown_rx,
        );

        store.create(pod("web-1")).unwrap();
        store.create(pod("web-2")).unwrap();

        wait_until(|| reconciler.seen().len() >= 2).await;
        let seen = reconciler.seen();
        assert!(seen.iter().any(|k| k.name == "web-1"));
        assert!(seen.iter().any(|k| k.name == "web-2"));

        shutdown_tx.send(true).unwrap();
        controller.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let store = ObjectStore::new();
        let reconciler = CountingReconciler::new(2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::spawn(
            Arc::clone(&reconciler),
            store.clone(),
            ControllerOptions {
                workers: 1,
                resync_interval: None,
                ..ControllerOptions::default()
            },
            shutdown_rx,
        );

        store.create(pod("web-1")).unwrap();

        wait_until(|| !reconciler.seen().is_empty()).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(reconciler.exhausted.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).unwrap();
        controller.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_hook_fires_at_attempt_cap() {
        let store = ObjectStore::new();
        let reconciler = CountingReconciler::new(u32::MAX);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::spawn(
            Arc::clone(&reconciler),
            store.clone(),
            ControllerOptions {
                workers: 1,
                max_attempts: 2,
                resync_interval: None,
                ..ControllerOptions::default()
            },
            shutdown_rx,
        );

        store.create(pod("web-1")).unwrap();

        wait_until(|| reconciler.exhausted.load(Ordering::SeqCst) > 0).await;
        // The hook fires exactly once even as retries continue.
        wait_until(|| reconciler.attempts.load(Ordering::SeqCst) > 3).await;
        assert_eq!(reconciler.exhausted.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        controller.join().await;
    }
}
