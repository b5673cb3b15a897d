use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{PodTemplateSpec, Service},
};
use kube::{ResourceExt, api::ObjectMeta, core::ErrorResponse};
use kube_runtime::reflector::{self, store::Writer};
use rustrial_k8s_deployment_exposer_apis::ResourceKey;

use crate::{
    cache::{CacheSyncHandle, ReflectorCache},
    errors::ControllerError,
    reconciler::{Reconcile, ReconcileOutcome, ServiceApi},
};

pub(crate) fn deployment(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}-{}", namespace, name)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// An unsynced [`ReflectorCache`] with its store writer.
pub(crate) fn cache() -> (ReflectorCache, Writer<Deployment>, CacheSyncHandle) {
    let (reader, writer) = reflector::store();
    let (cache, sync) = ReflectorCache::new(reader);
    (cache, writer, sync)
}

pub(crate) fn api_error(code: u16, reason: &str) -> ControllerError {
    ControllerError::KubeApi(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} error", reason),
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
struct FakeServices {
    services: BTreeMap<ResourceKey, Service>,
    gets: u32,
    creates: u32,
    applies: u32,
    failures: VecDeque<ControllerError>,
    race_next_create: bool,
}

impl FakeServices {
    fn fail(&mut self) -> Result<(), ControllerError> {
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Store `service` the way the API server would, adding server assigned fields.
    fn store(&mut self, namespace: &str, service: &Service) -> Service {
        let mut stored = service.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(format!("{}", self.creates + self.applies + 1));
        if let Some(spec) = stored.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.10".to_string());
            for port in spec.ports.iter_mut().flatten() {
                port.protocol.get_or_insert_with(|| "TCP".to_string());
            }
        }
        self.services.insert(
            ResourceKey::new(namespace, service.name_any()),
            stored.clone(),
        );
        stored
    }
}

/// In-memory [`ServiceApi`] counting the calls it receives.
#[derive(Clone, Default)]
pub(crate) struct FakeServiceApi {
    inner: Arc<Mutex<FakeServices>>,
}

impl FakeServiceApi {
    pub fn with_service(self, service: Service) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            let namespace = service.namespace().unwrap_or_default();
            inner.store(&namespace, &service);
        }
        self
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.inner
            .lock()
            .unwrap()
            .services
            .get(&ResourceKey::new(namespace, name))
            .cloned()
    }

    pub fn services(&self) -> usize {
        self.inner.lock().unwrap().services.len()
    }

    pub fn gets(&self) -> u32 {
        self.inner.lock().unwrap().gets
    }

    pub fn creates(&self) -> u32 {
        self.inner.lock().unwrap().creates
    }

    pub fn applies(&self) -> u32 {
        self.inner.lock().unwrap().applies
    }

    /// The next API call fails with `error`.
    pub fn fail_next(&self, error: ControllerError) {
        self.inner.lock().unwrap().failures.push_back(error);
    }

    /// Someone else creates the same Service right before our next create.
    pub fn race_next_create(&self) {
        self.inner.lock().unwrap().race_next_create = true;
    }
}

impl ServiceApi for FakeServiceApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>, ControllerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gets += 1;
        inner.fail()?;
        Ok(inner.services.get(&ResourceKey::new(namespace, name)).cloned())
    }

    async fn create(&self, namespace: &str, service: &Service) -> Result<Service, ControllerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail()?;
        let key = ResourceKey::new(namespace, service.name_any());
        if std::mem::take(&mut inner.race_next_create) {
            inner.store(namespace, service);
        }
        if inner.services.contains_key(&key) {
            return Err(ControllerError::AlreadyExists(format!(
                "services {:?} already exists",
                key.name
            )));
        }
        inner.creates += 1;
        Ok(inner.store(namespace, service))
    }

    async fn apply(
        &self,
        namespace: &str,
        _name: &str,
        service: &Service,
    ) -> Result<Service, ControllerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail()?;
        inner.applies += 1;
        Ok(inner.store(namespace, service))
    }
}

/// What [`ScriptedReconciler`] does on a call.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    Succeed,
    FailTemporarily,
    FailPermanently,
    Panic,
    Sleep(Duration),
}

/// [`Reconcile`] replaying a script of steps, then succeeding.
#[derive(Clone, Default)]
pub(crate) struct ScriptedReconciler {
    script: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<ResourceKey>>>,
    completed: Arc<Mutex<u32>>,
}

impl ScriptedReconciler {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ResourceKey> {
        self.calls.lock().unwrap().clone()
    }

    pub fn completed(&self) -> u32 {
        *self.completed.lock().unwrap()
    }
}

impl Reconcile for ScriptedReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ControllerError> {
        self.calls.lock().unwrap().push(key.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);
        let result = match step {
            Step::Succeed => Ok(ReconcileOutcome::Unchanged),
            Step::FailTemporarily => Err(api_error(500, "InternalError")),
            Step::FailPermanently => Err(ControllerError::InvalidResource(format!(
                "deployment {} has no pod template labels to select on",
                key
            ))),
            Step::Panic => panic!("reconcile of {} panicked", key),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ReconcileOutcome::Unchanged)
            }
        };
        *self.completed.lock().unwrap() += 1;
        result
    }
}

/// Poll `condition` every few milliseconds for up to 5 seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
