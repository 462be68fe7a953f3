//! Query stage: discover SANs from Kubernetes Services

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::poll::Poller;
use crate::store::ServiceLookup;
use crate::Result;

/// Namespace used when none can be detected
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace file mounted into pods with a service account
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace for bare service names
///
/// In-cluster the pod's own namespace, otherwise [`DEFAULT_NAMESPACE`].
pub fn current_namespace(in_cluster: bool) -> String {
    if !in_cluster {
        return DEFAULT_NAMESPACE.to_string();
    }
    namespace_from_file(Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH))
}

fn namespace_from_file(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(ns) if !ns.trim().is_empty() => {
            debug!(namespace = %ns.trim(), "detected namespace");
            ns.trim().to_string()
        }
        Ok(_) => {
            warn!(path = %path.display(), "empty namespace file, fallback to {DEFAULT_NAMESPACE:?}");
            DEFAULT_NAMESPACE.to_string()
        }
        Err(e) => {
            warn!(error = %e, "unexpected error during namespace detection, fallback to {DEFAULT_NAMESPACE:?}");
            DEFAULT_NAMESPACE.to_string()
        }
    }
}

/// A Service to query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Service namespace
    pub namespace: String,
    /// Service name
    pub name: String,
}

impl ServiceRef {
    /// Parse `namespace/name`, or a bare `name` in `default_namespace`
    pub fn parse(value: &str, default_namespace: &str) -> Self {
        match value.split_once('/') {
            Some((namespace, name)) => Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            None => {
                warn!(service = %value, "missing namespace, using {default_namespace:?}");
                Self {
                    namespace: default_namespace.to_string(),
                    name: value.to_string(),
                }
            }
        }
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "svc/{}/{}", self.namespace, self.name)
    }
}

/// Services to query and how long to wait for them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Services whose addresses become SANs
    pub services: Vec<ServiceRef>,
    /// Polling interval and timeout
    pub poller: Poller,
}

/// Looks up Services and returns their addresses
pub struct Query {
    lookup: Arc<dyn ServiceLookup>,
    config: QueryConfig,
}

impl Query {
    /// Create the stage
    pub fn new(lookup: Arc<dyn ServiceLookup>, config: QueryConfig) -> Self {
        Self { lookup, config }
    }

    /// Resolve every configured Service
    ///
    /// A missing Service resolves with no SANs. Only a remote error or the
    /// polling timeout fail the stage.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let sans = self
            .config
            .poller
            .poll("query kube-services", cancel, || self.resolve_all())
            .await?;
        info!(
            services = self.config.services.len(),
            sans = sans.len(),
            "services queried"
        );
        Ok(sans)
    }

    async fn resolve_all(&self) -> Result<Option<Vec<String>>> {
        let mut sans = Vec::new();
        for service in &self.config.services {
            match self
                .lookup
                .get_service(&service.namespace, &service.name)
                .await?
            {
                Some(addresses) => {
                    let found = addresses.subject_alternative_names();
                    debug!(service = %service, sans = ?found, "service resolved");
                    sans.extend(found);
                }
                None => warn!(service = %service, "service not found, no SAN added"),
            }
        }
        Ok(Some(sans))
    }
}
