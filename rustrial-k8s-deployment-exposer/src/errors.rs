use rustrial_k8s_deployment_exposer_apis::{DeriveError, KeyError};

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_already_exists(&self) -> bool;
    fn is_invalid(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => true,
            _ => false,
        }
    }

    fn is_invalid(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 400 || e.code == 422 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// The object to create exists already, returned by
    /// [`ServiceApi::create`](crate::reconciler::ServiceApi::create).
    #[error("{0}")]
    AlreadyExists(String),
    /// Queue key which cannot be split into namespace and name.
    #[error("{0}")]
    InvalidKey(#[from] KeyError),
    /// The watched object cannot be turned into a desired object, e.g. a
    /// Deployment without Pod template labels.
    #[error("{0}")]
    InvalidResource(String),
    /// The target object exists, differs and is not managed by us.
    #[error("{0}")]
    Unmanaged(String),
    /// The local cache did not (and will never) sync.
    #[error("{0}")]
    CacheSync(String),
}

impl From<DeriveError> for ControllerError {
    fn from(e: DeriveError) -> Self {
        match e {
            DeriveError::Key(e) => ControllerError::InvalidKey(e),
            e @ DeriveError::MissingSelector(_) => ControllerError::InvalidResource(e.to_string()),
        }
    }
}

impl ControllerError {
    /// Temporary errors are retried with backoff, retrying all others cannot
    /// succeed before the watched object changes.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::InvalidKey(_)
            | ControllerError::InvalidResource(_)
            | ControllerError::Unmanaged(_) => false,
            ControllerError::KubeApi(e) => !e.is_invalid(),
            _ => true,
        }
    }
}
