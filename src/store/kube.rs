//! Kubernetes-backed signing request store and service lookup

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, warn};

use super::{
    ConditionType, RequestCondition, ServiceAddresses, ServiceLookup, SigningRequest,
    SigningRequestStore,
};
use crate::{Error, Result};

/// Per-call timeout for connecting to and reading from the API server
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the configuration is inferred (in-cluster service account,
/// then `KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::client(format!("failed to read kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::client(format!("failed to load kubeconfig: {e}")))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::client(format!("failed to infer config: {e}")))?,
    };
    config.connect_timeout = Some(CLIENT_TIMEOUT);
    config.read_timeout = Some(CLIENT_TIMEOUT);
    Client::try_from(config).map_err(|e| Error::remote("create client", e))
}

/// Signing request store over `certificates.k8s.io/v1`
pub struct KubeSigningRequestStore {
    api: Api<CertificateSigningRequest>,
}

impl KubeSigningRequestStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl SigningRequestStore for KubeSigningRequestStore {
    async fn create(&self, request: &SigningRequest) -> Result<SigningRequest> {
        let csr = to_kube(request);
        let created = self
            .api
            .create(&PostParams::default(), &csr)
            .await
            .map_err(|e| Error::from_kube(&request.name, format!("create csr/{}", request.name), e))?;
        Ok(from_kube(created))
    }

    async fn get(&self, name: &str) -> Result<SigningRequest> {
        let csr = self
            .api
            .get(name)
            .await
            .map_err(|e| Error::from_kube(name, format!("get csr/{name}"), e))?;
        Ok(from_kube(csr))
    }

    async fn update(&self, request: &SigningRequest) -> Result<SigningRequest> {
        // The resource version in the patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": request.resource_version,
                "annotations": request.annotations,
            }
        });
        let updated = self
            .api
            .patch(&request.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(&request.name, format!("update csr/{}", request.name), e))?;
        Ok(from_kube(updated))
    }

    async fn update_approval(&self, request: &SigningRequest) -> Result<SigningRequest> {
        let csr = to_kube(request);
        let body = serde_json::to_vec(&csr)
            .map_err(|e| Error::validation(format!("cannot serialize csr/{}: {e}", request.name)))?;
        let updated = self
            .api
            .replace_subresource("approval", &request.name, &PostParams::default(), body)
            .await
            .map_err(|e| {
                Error::from_kube(&request.name, format!("approve csr/{}", request.name), e)
            })?;
        Ok(from_kube(updated))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(name, format!("delete csr/{name}"), e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SigningRequest>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube("", "list csr", e))?;
        Ok(list.items.into_iter().map(from_kube).collect())
    }
}

/// Service lookup over the core v1 API
pub struct KubeServiceLookup {
    client: Client,
}

impl KubeServiceLookup {
    /// Create a lookup using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceLookup for KubeServiceLookup {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceAddresses>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(name, format!("get svc/{namespace}/{name}"), e))?;
        Ok(service.map(|svc| {
            let spec = svc.spec.unwrap_or_default();
            ServiceAddresses {
                cluster_ip: spec.cluster_ip,
                external_ips: spec.external_ips.unwrap_or_default(),
                load_balancer_ip: spec.load_balancer_ip,
                external_name: spec.external_name,
            }
        }))
    }
}

fn to_kube(request: &SigningRequest) -> CertificateSigningRequest {
    let conditions: Vec<CertificateSigningRequestCondition> = request
        .conditions
        .iter()
        .map(|c| CertificateSigningRequestCondition {
            type_: c.type_.as_str().to_string(),
            status: c.status.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
            last_update_time: c.last_update_time.map(Time),
            last_transition_time: c.last_update_time.map(Time),
        })
        .collect();

    let status = if conditions.is_empty() && request.certificate.is_none() {
        None
    } else {
        Some(CertificateSigningRequestStatus {
            conditions: (!conditions.is_empty()).then_some(conditions),
            certificate: request.certificate.clone().map(ByteString),
        })
    };

    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            uid: request.uid.clone(),
            resource_version: request.resource_version.clone(),
            annotations: (!request.annotations.is_empty()).then(|| request.annotations.clone()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request.request.clone()),
            signer_name: request.signer_name.clone(),
            usages: (!request.usages.is_empty()).then(|| request.usages.clone()),
            ..Default::default()
        },
        status,
    }
}

fn from_kube(csr: CertificateSigningRequest) -> SigningRequest {
    let name = csr.metadata.name.unwrap_or_default();
    let status = csr.status.unwrap_or_default();

    let conditions = status
        .conditions
        .unwrap_or_default()
        .into_iter()
        .filter_map(|c| match ConditionType::parse(&c.type_) {
            Some(type_) => Some(RequestCondition {
                type_,
                status: c.status,
                reason: c.reason,
                message: c.message,
                last_update_time: c.last_update_time.map(|t| t.0),
            }),
            None => {
                warn!(csr = %name, condition = %c.type_, "ignoring unknown condition type");
                None
            }
        })
        .collect();

    let certificate = status.certificate.map(|c| c.0);
    if certificate.is_some() {
        debug!(csr = %name, "certificate present");
    }

    SigningRequest {
        name,
        uid: csr.metadata.uid,
        resource_version: csr.metadata.resource_version,
        request: csr.spec.request.0,
        signer_name: csr.spec.signer_name,
        usages: csr.spec.usages.unwrap_or_default(),
        conditions,
        annotations: csr.metadata.annotations.unwrap_or_default(),
        certificate,
    }
}
