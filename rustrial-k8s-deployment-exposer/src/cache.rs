use std::{future::Future, sync::Arc};

use k8s_openapi::api::apps::v1::Deployment;
use kube_runtime::reflector::{ObjectRef, Store};
use rustrial_k8s_deployment_exposer_apis::ResourceKey;
use tokio::sync::watch;

use crate::errors::ControllerError;

/// Read access to the locally mirrored Deployments.
pub(crate) trait LocalCache: Clone + Send + Sync + 'static {
    fn get(&self, key: &ResourceKey) -> Option<Arc<Deployment>>;

    /// Keys of all cached objects, used for periodic resyncs.
    fn keys(&self) -> Vec<ResourceKey>;

    /// `true` once the initial listing has been applied. Lookups on an
    /// unsynced cache might wrongly report objects as missing.
    fn has_synced(&self) -> bool;

    /// Wait until [`LocalCache::has_synced`], fails if the cache can never sync.
    fn wait_for_sync(&self) -> impl Future<Output = Result<(), ControllerError>> + Send;
}

/// [`LocalCache`] backed by a [`kube_runtime::reflector`] store.
#[derive(Clone)]
pub(crate) struct ReflectorCache {
    store: Store<Deployment>,
    synced: watch::Receiver<bool>,
}

/// Write half of the synced flag, owned by whoever consumes the reflector's events.
pub(crate) struct CacheSyncHandle {
    synced: watch::Sender<bool>,
}

impl CacheSyncHandle {
    /// Returns `true` if this call flipped the flag.
    pub fn mark_synced(&self) -> bool {
        !self.synced.send_replace(true)
    }
}

impl ReflectorCache {
    pub fn new(store: Store<Deployment>) -> (Self, CacheSyncHandle) {
        let (synced, receiver) = watch::channel(false);
        (
            Self {
                store,
                synced: receiver,
            },
            CacheSyncHandle { synced },
        )
    }
}

impl LocalCache for ReflectorCache {
    fn get(&self, key: &ResourceKey) -> Option<Arc<Deployment>> {
        let object_ref = ObjectRef::<Deployment>::new(key.name.as_str());
        let object_ref = if key.is_cluster_scoped() {
            object_ref
        } else {
            object_ref.within(key.namespace.as_str())
        };
        self.store.get(&object_ref)
    }

    fn keys(&self) -> Vec<ResourceKey> {
        self.store
            .state()
            .iter()
            .filter_map(|d| ResourceKey::from_resource(d.as_ref()).ok())
            .collect()
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        let mut synced = self.synced.clone();
        synced.wait_for(|synced| *synced).await.map(|_| ()).map_err(|_| {
            ControllerError::CacheSync(
                "deployment watch stopped before the initial listing completed".to_string(),
            )
        })
    }
}
