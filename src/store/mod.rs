//! Signing request store
//!
//! The authority side of the lifecycle is a named `CertificateSigningRequest`
//! resource. Components talk to it through [`SigningRequestStore`] so the
//! pipeline, the garbage collector and the renewal scheduler can be exercised
//! against a mock in tests while using the kube-backed implementation in
//! production.
//!
//! Every call is a single remote call bounded by the client's fixed timeout.
//! Nothing here retries: callers decide retry policy.

pub mod kube;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::Result;

pub use self::kube::{create_client, KubeServiceLookup, KubeSigningRequestStore};

/// Timestamp of the latest successful fetch, overridden by every fetch
pub const LAST_FETCH_TIME_ANNOTATION: &str = "alpha.kube-csr/lastFetchTime";

/// Number of successful fetches, incremented by every fetch
pub const FETCH_COUNT_ANNOTATION: &str = "alpha.kube-csr/fetchCount";

/// Format of [`LAST_FETCH_TIME_ANNOTATION`], matching the Kubernetes date format
pub const FETCH_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Condition type appended by the authority or an approver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    /// The request was approved for signing
    Approved,
    /// The request was denied
    Denied,
    /// The signer failed to issue a certificate
    Failed,
}

impl ConditionType {
    /// API string for this condition type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "Approved",
            Self::Denied => "Denied",
            Self::Failed => "Failed",
        }
    }

    /// Parse an API condition type, `None` for types this crate does not know
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Approved" => Some(Self::Approved),
            "Denied" => Some(Self::Denied),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a signing request's append-only condition list
#[derive(Debug, Clone, PartialEq)]
pub struct RequestCondition {
    /// Condition type
    pub type_: ConditionType,
    /// Condition status, "True" for conditions written by this crate
    pub status: String,
    /// Machine-readable reason
    pub reason: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// When the condition was last updated
    pub last_update_time: Option<DateTime<Utc>>,
}

impl RequestCondition {
    /// The Approved condition appended by the approve stage
    pub fn approved_now() -> Self {
        Self {
            type_: ConditionType::Approved,
            status: "True".to_string(),
            reason: Some("KubeCsrApprove".to_string()),
            message: Some("This CSR was approved by kube-csr".to_string()),
            last_update_time: Some(Utc::now()),
        }
    }

    /// Reason and message joined for logs and errors
    pub fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(r), Some(m)) => format!("{r}: {m}"),
            (Some(r), None) => r.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => String::new(),
        }
    }
}

/// The authority-side signing request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SigningRequest {
    /// Unique resource name
    pub name: String,
    /// Opaque identifier assigned by the authority on creation
    pub uid: Option<String>,
    /// Opaque version used for optimistic updates
    pub resource_version: Option<String>,
    /// PEM-encoded CSR
    pub request: Vec<u8>,
    /// Signer the request is addressed to
    pub signer_name: String,
    /// Requested key usages
    pub usages: Vec<String>,
    /// Append-only condition list
    pub conditions: Vec<RequestCondition>,
    /// Free-form annotations
    pub annotations: BTreeMap<String, String>,
    /// PEM-encoded certificate, present once signed
    pub certificate: Option<Vec<u8>>,
}

impl SigningRequest {
    /// A new, not yet submitted request
    pub fn new(
        name: impl Into<String>,
        request: Vec<u8>,
        signer_name: impl Into<String>,
        usages: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            request,
            signer_name: signer_name.into(),
            usages,
            ..Default::default()
        }
    }

    /// The uid for logs, empty until assigned
    pub fn uid(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }

    /// First condition of the given type, if any
    pub fn condition(&self, type_: ConditionType) -> Option<&RequestCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether an Approved condition is present
    pub fn is_approved(&self) -> bool {
        self.condition(ConditionType::Approved).is_some()
    }

    /// The signed certificate, if the authority issued one
    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref().filter(|c| !c.is_empty())
    }

    /// Parsed `fetchCount` annotation
    ///
    /// A missing annotation counts as zero fetches; an unparsable one is `None`.
    pub fn fetch_count(&self) -> Option<u64> {
        match self.annotations.get(FETCH_COUNT_ANNOTATION) {
            None => Some(0),
            Some(v) if v.is_empty() => Some(0),
            Some(v) => v.parse().ok(),
        }
    }

    /// Parsed `lastFetchTime` annotation
    pub fn last_fetch_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.annotations.get(LAST_FETCH_TIME_ANNOTATION)?;
        NaiveDateTime::parse_from_str(raw, FETCH_TIME_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }

    /// Stamp a successful fetch at `now`
    ///
    /// `fetchCount` is incremented from its previous value (an unparsable value
    /// restarts from zero) and `lastFetchTime` is overridden.
    pub fn record_fetch(&mut self, now: DateTime<Utc>) {
        let previous = self.fetch_count().unwrap_or(0);
        self.annotations.insert(
            LAST_FETCH_TIME_ANNOTATION.to_string(),
            now.format(FETCH_TIME_FORMAT).to_string(),
        );
        self.annotations.insert(
            FETCH_COUNT_ANNOTATION.to_string(),
            (previous + 1).to_string(),
        );
    }
}

/// Remote CRUD over named signing requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SigningRequestStore: Send + Sync {
    /// Create a signing request, `AlreadyExists` if the name is taken
    async fn create(&self, request: &SigningRequest) -> Result<SigningRequest>;

    /// Get a signing request by name, `NotFound` if absent
    async fn get(&self, name: &str) -> Result<SigningRequest>;

    /// Replace metadata of a signing request
    ///
    /// Optimistic: the caller passes the full resource it read, including its
    /// resource version. A stale write is rejected by the authority.
    async fn update(&self, request: &SigningRequest) -> Result<SigningRequest>;

    /// Replace the conditions of a signing request through the approval subresource
    async fn update_approval(&self, request: &SigningRequest) -> Result<SigningRequest>;

    /// Delete a signing request by name, `NotFound` if absent
    async fn delete(&self, name: &str) -> Result<()>;

    /// List every signing request visible to the caller
    async fn list(&self) -> Result<Vec<SigningRequest>>;
}

/// Address fields of a Service that can become subject alternative names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAddresses {
    /// `.spec.clusterIP`
    pub cluster_ip: Option<String>,
    /// `.spec.externalIPs`
    pub external_ips: Vec<String>,
    /// `.spec.loadBalancerIP`
    pub load_balancer_ip: Option<String>,
    /// `.spec.externalName`
    pub external_name: Option<String>,
}

impl ServiceAddresses {
    /// Every usable address, in field order
    ///
    /// Headless services report a cluster IP of `None`, which is not an address.
    pub fn subject_alternative_names(&self) -> Vec<String> {
        let cluster_ip = self
            .cluster_ip
            .iter()
            .filter(|ip| !ip.is_empty() && ip.as_str() != "None");
        cluster_ip
            .chain(self.external_ips.iter())
            .chain(self.load_balancer_ip.iter())
            .chain(self.external_name.iter())
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

/// Read-only lookup of Services for the query stage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    /// Get a Service's addresses, `None` when the Service does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceAddresses>>;
}
