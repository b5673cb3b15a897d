use std::fmt::Display;

use futures::{Stream, StreamExt};
use kube::Resource;
use kube_runtime::watcher::Event;
use rustrial_k8s_deployment_exposer_apis::ResourceKey;

use crate::{cache::CacheSyncHandle, work_queue::WorkQueue};

/// Turns watch events into work queue keys. Notifications carry no payload,
/// workers always read the latest state from the cache.
pub(crate) struct EventNotifier {
    queue: WorkQueue,
    sync: CacheSyncHandle,
    /// Keys seen during a (re-)list, the reflector store only exposes them
    /// once the listing is complete.
    listed: Vec<ResourceKey>,
}

impl EventNotifier {
    pub fn new(queue: WorkQueue, sync: CacheSyncHandle) -> Self {
        Self {
            queue,
            sync,
            listed: Vec::new(),
        }
    }

    pub fn on_add<K: Resource>(&self, obj: &K) {
        if let Some(key) = Self::key("add", obj) {
            self.queue.add(key.to_string());
        }
    }

    /// Deletions are enqueued like any other change; the reconciler will find
    /// the object gone from the cache.
    pub fn on_delete<K: Resource>(&self, obj: &K) {
        if let Some(key) = Self::key("delete", obj) {
            self.queue.add(key.to_string());
        }
    }

    fn key<K: Resource>(event: &str, obj: &K) -> Option<ResourceKey> {
        match ResourceKey::from_resource(obj) {
            Ok(key) => {
                trace!("{} notification for {}", event, key);
                Some(key)
            }
            Err(e) => {
                warn!("dropping {} notification: {}", event, e);
                None
            }
        }
    }

    pub fn handle<K: Resource>(&mut self, event: &Event<K>) {
        match event {
            Event::Apply(obj) => self.on_add(obj),
            Event::Delete(obj) => self.on_delete(obj),
            Event::Init => {
                debug!("listing watched objects");
                self.listed.clear();
            }
            Event::InitApply(obj) => {
                if let Some(key) = Self::key("add", obj) {
                    self.listed.push(key);
                }
            }
            Event::InitDone => {
                debug!("listed {} objects", self.listed.len());
                for key in self.listed.drain(..) {
                    self.queue.add(key.to_string());
                }
                if self.sync.mark_synced() {
                    info!("initial listing complete, cache synced");
                }
            }
        }
    }

    /// Consume the (reflected) watch stream until it ends. Watch errors are
    /// logged, the watcher recovers on its own.
    pub async fn run<K, E, S>(mut self, events: S)
    where
        K: Resource,
        E: Display,
        S: Stream<Item = Result<Event<K>, E>>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle(&event),
                Err(e) => warn!("watch failed: {}", e),
            }
        }
        warn!("watch stream ended");
    }
}
