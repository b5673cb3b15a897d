//! Deduplicating, rate limited FIFO of object keys.
//!
//! A key is either *pending* (in the FIFO), *in flight* (handed out by
//! [`WorkQueue::get`] and not yet released) or both *in flight* and *dirty*
//! (re-added while being processed). A dirty key goes back into the FIFO once
//! its [`QueueItem`] is released, so a key is never processed by two workers
//! at the same time and is never lost.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge, Meter},
};
use tokio::{
    sync::{Notify, watch},
    time::sleep,
};

use crate::{rate_limiter::RateLimiter, utils::metric_name};

const WORK_QUEUE: &'static str = "work_queue";

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct QueueMetrics {
    adds: Counter<u64>,
    retries: Counter<u64>,
    depth: Gauge<u64>,
    labels: [KeyValue; 1],
}

impl QueueMetrics {
    fn new(name: &str) -> Self {
        let meter: Meter = global::meter(WORK_QUEUE);
        Self {
            adds: meter
                .u64_counter(metric_name("workqueue_adds"))
                .with_description("Count of keys added to the work queue")
                .build(),
            retries: meter
                .u64_counter(metric_name("workqueue_retries"))
                .with_description("Count of rate limited re-adds after a failure")
                .build(),
            depth: meter
                .u64_gauge(metric_name("workqueue_depth"))
                .with_description("Number of keys waiting in the work queue")
                .build(),
            labels: [KeyValue::new("name", name.to_string())],
        }
    }
}

struct Inner {
    state: Mutex<State>,
    available: Notify,
    shutdown: watch::Sender<bool>,
    rate_limiter: Box<dyn RateLimiter>,
    metrics: QueueMetrics,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, state: &State) {
        self.metrics
            .depth
            .record(state.queue.len() as u64, &self.metrics.labels);
    }
}

/// Cheaply cloneable handle, all clones share the same queue.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new<R: RateLimiter + 'static>(name: &str, rate_limiter: R) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Default::default(),
                available: Notify::new(),
                shutdown,
                rate_limiter: Box::new(rate_limiter),
                metrics: QueueMetrics::new(name),
            }),
        }
    }

    /// Add `key` unless it is already pending. Keys added while in flight
    /// are queued again as soon as they are released.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.inner.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            self.inner.metrics.adds.add(1, &self.inner.metrics.labels);
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
            self.inner.record_depth(&state);
        }
        self.inner.available.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shutting down.
    ///
    /// The key stays in flight until the returned [`QueueItem`] is dropped.
    pub async fn get(&self) -> Option<QueueItem> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register interest before inspecting the state, so an `add`
            // racing with this check cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = self.inner.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.inner.record_depth(&state);
                    return Some(QueueItem {
                        queue: self.clone(),
                        key,
                    });
                }
            }
            notified.await;
        }
    }

    fn done(&self, key: &str) {
        {
            let mut state = self.inner.lock();
            state.processing.remove(key);
            if state.shutting_down || !state.dirty.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
            self.inner.record_depth(&state);
        }
        self.inner.available.notify_one();
    }

    /// Clear the retry history of `key`.
    pub fn forget(&self, key: &str) {
        self.inner.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Re-add `key` after the backoff delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.rate_limiter.when(key);
        self.inner.metrics.retries.add(1, &self.inner.metrics.labels);
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` elapsed, unless the queue shuts down before.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => queue.add(key),
                _ = queue.closed() => (),
            }
        });
    }

    /// Stop handing out keys. Pending keys are discarded, waiting
    /// [`WorkQueue::get`] calls return `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            self.inner.record_depth(&state);
        }
        self.inner.shutdown.send_replace(true);
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Resolves once [`WorkQueue::shut_down`] was called.
    pub async fn closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // The sender lives as long as `self`, so this only returns on shutdown.
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

/// A key handed out by [`WorkQueue::get`]. Dropping it marks the key as done,
/// which makes sure it is released on every exit path of a worker.
pub(crate) struct QueueItem {
    queue: WorkQueue,
    key: String,
}

impl QueueItem {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the key, same as dropping the item.
    pub fn done(self) {}
}

impl Drop for QueueItem {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}
