use std::{collections::BTreeMap, fmt, str::FromStr};

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Service, ServicePort, ServiceSpec},
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Annotation on a derived [`Service`] pointing back to its source [`Deployment`] (`{namespace}/{name}`).
pub const SOURCE_DEPLOYMENT_ANNOTATION: &'static str = "expose.rustrial.org/source-deployment";

pub const MANAGED_BY_LABEL: &'static str = "app.kubernetes.io/managed-by";

/// The K8s field manager name, also used as value of the [`MANAGED_BY_LABEL`].
pub const MANAGER: &'static str = "rustrial-deployment-exposer";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Keys are either `name` or `namespace/name`.
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
    #[error("object has no name")]
    MissingName,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    #[error("{0}")]
    Key(#[from] KeyError),
    /// A Service without selector would not route to any Pod of the Deployment.
    #[error("deployment {0} has no pod template labels to select on")]
    MissingSelector(String),
}

/// Stable identity of a watched object, the unit of work of the controller's queue.
///
/// The string representation is `{namespace}/{name}` or just `{name}` for
/// cluster scoped objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key from an object's metadata, fails if the object has no name.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.clone().unwrap_or_default(), name))
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cluster_scoped() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new("", name)),
            (Some(namespace), Some(name), None) if !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

/// Kubernetes Service type of the derived Service.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIP => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }
}

impl Default for ServiceType {
    fn default() -> Self {
        Self::NodePort
    }
}

/// Shape of the Service created for each Deployment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExposePolicy {
    /// The Service port, defaults to `80`.
    pub port: i32,
    /// The Service port name, defaults to `http`.
    pub port_name: String,
    /// Defaults to `NodePort`.
    pub service_type: ServiceType,
    /// The container port to forward to, defaults to [`ExposePolicy::port`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

impl Default for ExposePolicy {
    fn default() -> Self {
        Self {
            port: 80,
            port_name: "http".to_string(),
            service_type: ServiceType::default(),
            target_port: None,
        }
    }
}

impl ExposePolicy {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    fn service_port(&self) -> ServicePort {
        ServicePort {
            name: Some(self.port_name.clone()),
            port: self.port,
            target_port: self.target_port.map(IntOrString::Int),
            ..Default::default()
        }
    }
}

/// The labels of the Deployment's Pod template, which become the Service selector.
pub fn pod_template_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
}

/// Compute the Service which should exist for `deployment`.
///
/// The result only depends on the Deployment's identity, UID and Pod template
/// labels, so repeated calls for an unchanged Deployment yield the same object.
pub fn desired_service(
    deployment: &Deployment,
    policy: &ExposePolicy,
) -> Result<Service, DeriveError> {
    let key = ResourceKey::from_resource(deployment)?;
    let selector = pod_template_labels(deployment)
        .filter(|labels| !labels.is_empty())
        .cloned()
        .ok_or_else(|| DeriveError::MissingSelector(key.to_string()))?;
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    let mut annotations = BTreeMap::new();
    annotations.insert(SOURCE_DEPLOYMENT_ANNOTATION.to_string(), key.to_string());
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: deployment.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: deployment.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![policy.service_port()]),
            selector: Some(selector),
            type_: Some(policy.service_type.as_str().to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Whether the object carries our `app.kubernetes.io/managed-by` label.
pub fn is_managed<K: Resource>(obj: &K) -> bool {
    obj.labels().get(MANAGED_BY_LABEL).map(|v| v.as_str()) == Some(MANAGER)
}

/// UID of the object's controller owner reference, if any.
pub fn controller_uid<K: Resource>(obj: &K) -> Option<&str> {
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| o.uid.as_str())
}

/// Whether `current` is controlled by the same owner `desired` points to.
///
/// A Service left behind by a deleted Deployment of the same name still
/// points to the old UID and would be garbage collected.
pub fn owner_matches<K: Resource>(current: &K, desired: &K) -> bool {
    controller_uid(current) == controller_uid(desired)
}

/// Check whether the `current` Service already provides what `desired` asks for.
///
/// Server assigned or defaulted fields (cluster IP, node ports, protocol and
/// target port defaults) are ignored.
pub fn service_matches(current: &Service, desired: &Service) -> bool {
    let empty = ServiceSpec::default();
    let current = current.spec.as_ref().unwrap_or(&empty);
    let desired = desired.spec.as_ref().unwrap_or(&empty);
    let selector_matches =
        current.selector.clone().unwrap_or_default() == desired.selector.clone().unwrap_or_default();
    let type_matches = current.type_.as_deref().unwrap_or("ClusterIP")
        == desired.type_.as_deref().unwrap_or("ClusterIP");
    let current_ports = current.ports.as_deref().unwrap_or_default();
    let desired_ports = desired.ports.as_deref().unwrap_or_default();
    let ports_match = current_ports.len() == desired_ports.len()
        && desired_ports
            .iter()
            .all(|d| current_ports.iter().any(|c| port_matches(c, d)));
    selector_matches && type_matches && ports_match
}

fn port_matches(current: &ServicePort, desired: &ServicePort) -> bool {
    fn target(p: &ServicePort) -> IntOrString {
        p.target_port.clone().unwrap_or(IntOrString::Int(p.port))
    }
    current.name == desired.name
        && current.port == desired.port
        && current.protocol.as_deref().unwrap_or("TCP") == desired.protocol.as_deref().unwrap_or("TCP")
        && target(current) == target(desired)
}
