use std::{future::Future, sync::Arc, time::Duration};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use rustrial_k8s_deployment_exposer_apis::ResourceKey;
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{Instant, interval_at, sleep, timeout},
};

use crate::{
    cache::LocalCache,
    errors::ControllerError,
    reconciler::{Reconcile, ReconcileOutcome},
    utils::metric_name,
    work_queue::WorkQueue,
};

const CONTROLLER: &'static str = "controller";

/// Delay before a panicked worker is restarted.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ControllerState {
    Created,
    Running,
    Stopped,
}

#[derive(Clone, Debug)]
pub(crate) struct ControllerSettings {
    /// Number of concurrent workers, at least one.
    pub workers: usize,
    /// Re-enqueue all cached keys this often, `None` disables resyncs.
    pub resync_period: Option<Duration>,
    /// Log a warning each time the cache did not sync within this period.
    pub cache_sync_timeout: Duration,
    /// Drop a key after this many failed retries, `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            resync_period: Some(Duration::from_secs(600)),
            cache_sync_timeout: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

struct ReconcileMetrics {
    count: Counter<u64>,
    errors: Counter<u64>,
    duration: Histogram<u64>,
    dropped: Counter<u64>,
}

impl ReconcileMetrics {
    fn new() -> Self {
        let meter: Meter = global::meter(CONTROLLER);
        Self {
            count: meter
                .u64_counter(metric_name("reconcile_count"))
                .with_description("Count of successful reconciliations")
                .build(),
            errors: meter
                .u64_counter(metric_name("reconcile_errors"))
                .with_description("Count of failed reconciliations")
                .build(),
            duration: meter
                .u64_histogram(metric_name("reconcile_duration_ms"))
                .with_description("Reconciliation latency in milliseconds")
                .build(),
            dropped: meter
                .u64_counter(metric_name("dropped_keys"))
                .with_description("Count of keys dropped without successful reconciliation")
                .build(),
        }
    }
}

/// Drives a [`Reconcile`] implementation from a [`WorkQueue`] once the
/// [`LocalCache`] has synced.
pub(crate) struct Controller<R, C> {
    reconciler: Arc<R>,
    cache: C,
    queue: WorkQueue,
    settings: ControllerSettings,
    state: watch::Sender<ControllerState>,
    metrics: Arc<ReconcileMetrics>,
}

impl<R: Reconcile, C: LocalCache> Controller<R, C> {
    pub fn new(reconciler: R, cache: C, queue: WorkQueue, settings: ControllerSettings) -> Self {
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            reconciler: Arc::new(reconciler),
            cache,
            queue,
            settings,
            state,
            metrics: Arc::new(ReconcileMetrics::new()),
        }
    }

    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Run until `stop` resolves.
    ///
    /// Workers only start once the cache has synced. On stop the queue is shut
    /// down (discarding pending keys) and in-flight reconciliations are awaited.
    pub async fn run<F: Future<Output = ()>>(self, stop: F) -> Result<(), ControllerError> {
        self.state.send_replace(ControllerState::Running);
        tokio::pin!(stop);
        info!("waiting for cache to sync");
        tokio::select! {
            synced = self.wait_for_cache_sync() => {
                if let Err(e) = synced {
                    error!("cache failed to sync: {}", e);
                    self.stopped();
                    return Err(e);
                }
            }
            _ = &mut stop => {
                info!("stop requested before cache sync");
                self.stopped();
                return Ok(());
            }
        }
        let workers = self.settings.workers.max(1);
        info!("cache synced, starting {} worker(s)", workers);
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            tasks.spawn(
                Worker {
                    id,
                    reconciler: self.reconciler.clone(),
                    queue: self.queue.clone(),
                    max_retries: self.settings.max_retries,
                    metrics: self.metrics.clone(),
                }
                .supervise(),
            );
        }
        if let Some(period) = self.settings.resync_period {
            tasks.spawn(resync(self.cache.clone(), self.queue.clone(), period));
        }
        stop.await;
        info!("stopping controller");
        self.queue.shut_down();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("controller task failed: {}", e);
            }
        }
        self.stopped();
        Ok(())
    }

    fn stopped(&self) {
        self.queue.shut_down();
        self.state.send_replace(ControllerState::Stopped);
        info!("controller stopped");
    }

    async fn wait_for_cache_sync(&self) -> Result<(), ControllerError> {
        let period = self.settings.cache_sync_timeout;
        loop {
            match timeout(period, self.cache.wait_for_sync()).await {
                Ok(result) => return result,
                Err(_) => warn!("cache not synced after {:?}, still waiting", period),
            }
        }
    }
}

/// Periodically enqueue every cached key, so failures dropped earlier and
/// missed notifications are eventually reconciled.
async fn resync<C: LocalCache>(cache: C, queue: WorkQueue, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let keys = cache.keys();
                debug!("resync of {} object(s), {} key(s) pending", keys.len(), queue.len());
                for key in keys {
                    queue.add(key.to_string());
                }
            }
            _ = queue.closed() => return,
        }
    }
}

struct Worker<R> {
    id: usize,
    reconciler: Arc<R>,
    queue: WorkQueue,
    max_retries: Option<u32>,
    metrics: Arc<ReconcileMetrics>,
}

impl<R> Clone for Worker<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            reconciler: self.reconciler.clone(),
            queue: self.queue.clone(),
            max_retries: self.max_retries,
            metrics: self.metrics.clone(),
        }
    }
}

impl<R: Reconcile> Worker<R> {
    /// Run the worker loop, restarting it after a panic until the queue shuts down.
    async fn supervise(self) {
        loop {
            match tokio::spawn(self.clone().run()).await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    error!(
                        "worker {} panicked, restarting in {:?}",
                        self.id, WORKER_RESTART_DELAY
                    );
                    tokio::select! {
                        _ = sleep(WORKER_RESTART_DELAY) => (),
                        _ = self.queue.closed() => return,
                    }
                }
                Err(e) => {
                    error!("worker {} failed: {}", self.id, e);
                    return;
                }
            }
        }
    }

    async fn run(self) {
        debug!("worker {} started", self.id);
        while self.process_next_item().await {}
        debug!("worker {} stopped", self.id);
    }

    /// Returns `false` once the queue is shutting down.
    async fn process_next_item(&self) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };
        let key = item.key();
        let parsed: ResourceKey = match key.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping invalid key: {}", e);
                self.queue.forget(key);
                item.done();
                return true;
            }
        };
        let start = Instant::now();
        let result = self.reconciler.reconcile(&parsed).await;
        let elapsed = start.elapsed().as_millis() as u64;
        self.handle_result(key, result, elapsed);
        item.done();
        true
    }

    fn handle_result(
        &self,
        key: &str,
        result: Result<ReconcileOutcome, ControllerError>,
        elapsed_ms: u64,
    ) {
        match result {
            Ok(outcome) => {
                let labels = [KeyValue::new("outcome", outcome.as_str())];
                self.metrics.count.add(1, &labels);
                self.metrics.duration.record(elapsed_ms, &labels);
                trace!("reconciled {} ({}) in {}ms", key, outcome, elapsed_ms);
                self.queue.forget(key);
            }
            Err(e) => {
                let labels = [KeyValue::new("outcome", "error")];
                self.metrics.errors.add(1, &[]);
                self.metrics.duration.record(elapsed_ms, &labels);
                if !e.is_temporary() {
                    error!("failed to reconcile {}, not retrying: {}", key, e);
                    self.metrics.dropped.add(1, &[]);
                    self.queue.forget(key);
                    return;
                }
                let retries = self.queue.num_requeues(key);
                if self.max_retries.map_or(true, |max| retries < max) {
                    warn!(
                        "failed to reconcile {} (retry {}): {}",
                        key,
                        retries + 1,
                        e
                    );
                    self.queue.add_rate_limited(key);
                } else {
                    error!("dropping {} after {} retries: {}", key, retries, e);
                    self.metrics.dropped.add(1, &[]);
                    self.queue.forget(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notifier::EventNotifier,
        rate_limiter::default_controller_rate_limiter,
        reconciler::ServiceReconciler,
        test_utils::{FakeServiceApi, ScriptedReconciler, Step, cache, deployment, eventually},
    };
    use kube_runtime::watcher::Event;
    use rustrial_k8s_deployment_exposer_apis::ExposePolicy;
    use tokio::sync::oneshot;

    fn queue() -> WorkQueue {
        WorkQueue::new("test", default_controller_rate_limiter())
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            workers: 2,
            resync_period: None,
            cache_sync_timeout: Duration::from_millis(50),
            max_retries: None,
        }
    }

    /// Spawn `controller`, returning the stop trigger and the join handle.
    fn start<R: Reconcile, C: LocalCache>(
        controller: Controller<R, C>,
    ) -> (
        oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<(), ControllerError>>,
    ) {
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(controller.run(async move {
            let _ = stopped.await;
        }));
        (stop, handle)
    }

    #[tokio::test]
    async fn initial_listing_creates_one_service_each() {
        let (cache, mut writer, sync) = cache();
        let queue = queue();
        let mut notifier = EventNotifier::new(queue.clone(), sync);
        let services = FakeServiceApi::default();
        let reconciler = ServiceReconciler::new(
            cache.clone(),
            services.clone(),
            ExposePolicy::default(),
            None,
        );
        let controller = Controller::new(reconciler, cache, queue.clone(), settings());
        let state = controller.state();
        assert_eq!(ControllerState::Created, *state.borrow());

        let (stop, handle) = start(controller);
        let names = ["web", "api", "db"];
        let mut listing = vec![Event::Init];
        for name in names {
            listing.push(Event::InitApply(deployment("default", name, &[("app", name)])));
        }
        listing.push(Event::InitDone);
        for event in &listing {
            writer.apply_watcher_event(event);
            notifier.handle(event);
        }
        assert!(eventually(|| services.creates() == 3).await);
        assert_eq!(ControllerState::Running, *state.borrow());

        // Redundant notifications do not create anything new.
        for name in names {
            let event = Event::Apply(deployment("default", name, &[("app", name)]));
            writer.apply_watcher_event(&event);
            notifier.handle(&event);
        }
        assert!(eventually(|| queue.len() == 0).await);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(3, services.creates());
        assert_eq!(3, services.services());

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(ControllerState::Stopped, *state.borrow());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn workers_wait_for_cache_sync() {
        let (cache, _writer, sync) = cache();
        let queue = queue();
        let reconciler = ScriptedReconciler::default();
        let controller = Controller::new(reconciler.clone(), cache, queue.clone(), settings());
        let (stop, handle) = start(controller);
        queue.add("default/web");
        // Longer than the sync timeout, the controller keeps waiting.
        sleep(Duration::from_millis(150)).await;
        assert!(reconciler.calls().is_empty());

        sync.mark_synced();
        assert!(eventually(|| reconciler.completed() == 1).await);
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_before_sync() {
        let (cache, _writer, _sync) = cache();
        let queue = queue();
        let reconciler = ScriptedReconciler::default();
        let controller = Controller::new(reconciler.clone(), cache, queue.clone(), settings());
        let state = controller.state();
        let (stop, handle) = start(controller);
        queue.add("default/web");
        stop.send(()).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ControllerState::Stopped, *state.borrow());
        assert!(reconciler.calls().is_empty());
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn sync_failure_is_an_error() {
        let (cache, _writer, sync) = cache();
        drop(sync);
        let controller = Controller::new(
            ScriptedReconciler::default(),
            cache,
            queue(),
            settings(),
        );
        let state = controller.state();
        let result = controller.run(futures::future::pending()).await;
        assert!(matches!(result, Err(ControllerError::CacheSync(_))));
        assert_eq!(ControllerState::Stopped, *state.borrow());
    }

    async fn run_script(steps: Vec<Step>, settings: ControllerSettings) -> ScriptedReconciler {
        let (cache, _writer, sync) = cache();
        sync.mark_synced();
        let queue = queue();
        let reconciler = ScriptedReconciler::new(steps);
        let controller = Controller::new(reconciler.clone(), cache, queue.clone(), settings);
        let (stop, handle) = start(controller);
        queue.add("default/web");
        // Let retries (5ms, 10ms, 20ms, ...) play out.
        sleep(Duration::from_millis(300)).await;
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        reconciler
    }

    #[tokio::test]
    async fn temporary_errors_are_retried() {
        let reconciler = run_script(
            vec![Step::FailTemporarily, Step::FailTemporarily],
            settings(),
        )
        .await;
        assert_eq!(3, reconciler.calls().len());
        assert!(
            reconciler
                .calls()
                .iter()
                .all(|k| *k == ResourceKey::new("default", "web"))
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let reconciler = run_script(vec![Step::FailPermanently], settings()).await;
        assert_eq!(1, reconciler.calls().len());
    }

    #[tokio::test]
    async fn retries_are_capped() {
        let settings = ControllerSettings {
            max_retries: Some(2),
            ..settings()
        };
        let reconciler = run_script(vec![Step::FailTemporarily; 10], settings).await;
        assert_eq!(3, reconciler.calls().len());
    }

    #[tokio::test]
    async fn invalid_keys_are_dropped() {
        let (cache, _writer, sync) = cache();
        sync.mark_synced();
        let queue = queue();
        let reconciler = ScriptedReconciler::default();
        let controller = Controller::new(reconciler.clone(), cache, queue.clone(), settings());
        let (stop, handle) = start(controller);
        queue.add("a/b/c");
        queue.add("default/web");
        assert!(eventually(|| reconciler.completed() == 1).await);
        assert_eq!(vec![ResourceKey::new("default", "web")], reconciler.calls());
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicked_worker_is_restarted() {
        let (cache, _writer, sync) = cache();
        sync.mark_synced();
        let queue = queue();
        let reconciler = ScriptedReconciler::new([Step::Panic]);
        let settings = ControllerSettings {
            workers: 1,
            ..settings()
        };
        let controller = Controller::new(reconciler.clone(), cache, queue.clone(), settings);
        let (stop, handle) = start(controller);
        queue.add("default/web");
        assert!(eventually(|| reconciler.calls().len() == 1).await);
        queue.add("default/api");
        assert!(eventually(|| reconciler.completed() == 1).await);
        assert_eq!(
            vec![
                ResourceKey::new("default", "web"),
                ResourceKey::new("default", "api")
            ],
            reconciler.calls()
        );
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resync_revisits_cached_objects() {
        let (cache, mut writer, sync) = cache();
        writer.apply_watcher_event(&Event::Apply(deployment("default", "web", &[("app", "web")])));
        sync.mark_synced();
        let reconciler = ScriptedReconciler::default();
        let settings = ControllerSettings {
            resync_period: Some(Duration::from_millis(20)),
            ..settings()
        };
        let controller = Controller::new(reconciler.clone(), cache, queue(), settings);
        let (stop, handle) = start(controller);
        assert!(eventually(|| reconciler.completed() >= 3).await);
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_reconcile() {
        let (cache, _writer, sync) = cache();
        sync.mark_synced();
        let queue = queue();
        let reconciler = ScriptedReconciler::new([Step::Sleep(Duration::from_millis(200))]);
        let settings = ControllerSettings {
            workers: 1,
            ..settings()
        };
        let controller = Controller::new(reconciler.clone(), cache, queue.clone(), settings);
        let (stop, handle) = start(controller);
        queue.add("default/web");
        assert!(eventually(|| reconciler.calls().len() == 1).await);
        queue.add("default/api");
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(1, reconciler.completed());
        // The pending key is discarded on shutdown.
        assert_eq!(1, reconciler.calls().len());
    }
}
