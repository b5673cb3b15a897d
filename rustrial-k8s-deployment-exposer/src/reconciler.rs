use std::{collections::HashSet, fmt, future::Future};

use k8s_openapi::api::core::v1::Service;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams, PostParams},
};
use rustrial_k8s_deployment_exposer_apis::{
    ExposePolicy, MANAGER, ResourceKey, desired_service, is_managed, owner_matches,
    service_matches,
};

use crate::{
    cache::LocalCache,
    errors::{ControllerError, ExtKubeApiError},
    utils::contains_namespace,
};

/// What a successful reconcile did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReconcileOutcome {
    /// The Service did not exist and was created.
    Created,
    /// The Service drifted and was updated.
    Updated,
    /// The Service already matched.
    Unchanged,
    /// The Deployment does not exist (anymore).
    Gone,
    /// The Deployment is in a namespace which is not watched.
    Ignored,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Gone => "gone",
            Self::Ignored => "ignored",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bring the world in line with the cached state of one object.
///
/// Must be idempotent: it is called at least once per change and again on
/// every resync, with nothing but the object's key.
pub(crate) trait Reconcile: Send + Sync + 'static {
    fn reconcile(
        &self,
        key: &ResourceKey,
    ) -> impl Future<Output = Result<ReconcileOutcome, ControllerError>> + Send;
}

/// The subset of the Service API the reconciler needs.
pub(crate) trait ServiceApi: Send + Sync + 'static {
    fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Service>, ControllerError>> + Send;

    /// Fails with [`ControllerError::AlreadyExists`] if a Service with the same name exists.
    fn create(
        &self,
        namespace: &str,
        service: &Service,
    ) -> impl Future<Output = Result<Service, ControllerError>> + Send;

    /// Server-side apply of `service`, taking over conflicting fields.
    fn apply(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> impl Future<Output = Result<Service, ControllerError>> + Send;
}

#[derive(Clone)]
pub(crate) struct KubeServiceApi {
    client: Client,
}

impl KubeServiceApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ServiceApi for KubeServiceApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>, ControllerError> {
        match self.api(namespace).get(name).await {
            Ok(service) => Ok(Some(service)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, namespace: &str, service: &Service) -> Result<Service, ControllerError> {
        let pp = PostParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        };
        match self.api(namespace).create(&pp, service).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_already_exists() => Err(ControllerError::AlreadyExists(format!(
                "service {}/{}: {}",
                namespace,
                service.name_any(),
                e
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> Result<Service, ControllerError> {
        let pp = PatchParams::apply(MANAGER).force();
        Ok(self
            .api(namespace)
            .patch(name, &pp, &Patch::Apply(service))
            .await?)
    }
}

/// Makes sure a Service exists for every cached Deployment.
pub(crate) struct ServiceReconciler<C, S> {
    cache: C,
    services: S,
    policy: ExposePolicy,
    watch_namespaces: Option<HashSet<String>>,
}

impl<C: LocalCache, S: ServiceApi> ServiceReconciler<C, S> {
    pub fn new(
        cache: C,
        services: S,
        policy: ExposePolicy,
        watch_namespaces: Option<HashSet<String>>,
    ) -> Self {
        Self {
            cache,
            services,
            policy,
            watch_namespaces,
        }
    }

    async fn converge(
        &self,
        key: &ResourceKey,
        current: &Service,
        desired: &Service,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let managed = is_managed(current);
        if service_matches(current, desired) && (!managed || owner_matches(current, desired)) {
            trace!("service {} is up to date", key);
            return Ok(ReconcileOutcome::Unchanged);
        }
        if !managed {
            return Err(ControllerError::Unmanaged(format!(
                "service {} differs from the desired state but is not managed by {}, leaving it alone",
                key, MANAGER
            )));
        }
        self.services
            .apply(&key.namespace, &key.name, desired)
            .await?;
        info!("updated service for deployment {}", key);
        Ok(ReconcileOutcome::Updated)
    }
}

impl<C: LocalCache, S: ServiceApi> Reconcile for ServiceReconciler<C, S> {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ControllerError> {
        if !contains_namespace(&self.watch_namespaces, &key.namespace) {
            debug!(
                "ignore deployment {} as its namespace is not in the set of namespaces to watch",
                key
            );
            return Ok(ReconcileOutcome::Ignored);
        }
        let Some(deployment) = self.cache.get(key) else {
            // The Service is garbage collected through its owner reference.
            debug!("deployment {} does not exist anymore", key);
            return Ok(ReconcileOutcome::Gone);
        };
        let desired = desired_service(&deployment, &self.policy)?;
        let current = match self.services.get(&key.namespace, &key.name).await? {
            Some(current) => current,
            None => match self.services.create(&key.namespace, &desired).await {
                Ok(_) => {
                    info!("created service for deployment {}", key);
                    return Ok(ReconcileOutcome::Created);
                }
                Err(ControllerError::AlreadyExists(e)) => {
                    debug!("service {} was created concurrently: {}", key, e);
                    self.services
                        .get(&key.namespace, &key.name)
                        .await?
                        .ok_or_else(|| {
                            ControllerError::AlreadyExists(format!(
                                "service {} reported as existing but not found",
                                key
                            ))
                        })?
                }
                Err(e) => return Err(e),
            },
        };
        self.converge(key, &current, &desired).await
    }
}
