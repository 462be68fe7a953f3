//! Test helpers: an in-memory signing request store and certificate fixtures

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use uuid::Uuid;

use kube_csr::pipeline::SigningRequestSpec;
use kube_csr::store::{ConditionType, RequestCondition, SigningRequest, SigningRequestStore};
use kube_csr::{Error, Result};

/// What the scripted signer does when a request is read
pub enum Reaction {
    /// Leave the request untouched
    Nothing,
    /// Attach this certificate
    Sign(Vec<u8>),
    /// Append a condition of this type with a message
    Reject(ConditionType, &'static str),
}

type Signer = Box<dyn Fn(&SigningRequest, u32) -> Reaction + Send + Sync>;

#[derive(Default)]
struct State {
    requests: BTreeMap<String, SigningRequest>,
    version: u64,
    gets: BTreeMap<String, u32>,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }
}

/// Signing request store kept in memory
///
/// Assigns uids and resource versions like the API server and rejects stale
/// updates. The optional signer reacts to every `get` with the request and
/// how many times it has been read.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    signer: Option<Signer>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signer<F>(signer: F) -> Self
    where
        F: Fn(&SigningRequest, u32) -> Reaction + Send + Sync + 'static,
    {
        Self {
            state: Mutex::default(),
            signer: Some(Box::new(signer)),
        }
    }

    /// Current remote state of `name`
    pub fn snapshot(&self, name: &str) -> Option<SigningRequest> {
        self.state.lock().unwrap().requests.get(name).cloned()
    }

    /// Names of every stored request
    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.keys().cloned().collect()
    }

    /// Store `request` as is, bypassing create
    pub fn seed(&self, mut request: SigningRequest) {
        let mut state = self.state.lock().unwrap();
        request.uid = Some(Uuid::new_v4().to_string());
        request.resource_version = state.next_version();
        state.requests.insert(request.name.clone(), request);
    }

    /// How many times `name` has been read
    pub fn gets(&self, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .gets
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SigningRequestStore for InMemoryStore {
    async fn create(&self, request: &SigningRequest) -> Result<SigningRequest> {
        let mut state = self.state.lock().unwrap();
        if state.requests.contains_key(&request.name) {
            return Err(Error::AlreadyExists {
                name: request.name.clone(),
            });
        }
        let mut created = request.clone();
        created.uid = Some(Uuid::new_v4().to_string());
        created.resource_version = state.next_version();
        created.conditions.clear();
        created.certificate = None;
        state.requests.insert(created.name.clone(), created.clone());
        Ok(created)
    }

    async fn get(&self, name: &str) -> Result<SigningRequest> {
        let mut state = self.state.lock().unwrap();
        let count = {
            let gets = state.gets.entry(name.to_string()).or_default();
            *gets += 1;
            *gets
        };
        let Some(current) = state.requests.get(name).cloned() else {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        };

        let reaction = match &self.signer {
            Some(signer) => signer(&current, count),
            None => Reaction::Nothing,
        };
        let mut updated = current;
        match reaction {
            Reaction::Nothing => return Ok(updated),
            Reaction::Sign(certificate) => {
                if updated.certificate.is_none() {
                    updated.certificate = Some(certificate);
                }
            }
            Reaction::Reject(type_, message) => updated.conditions.push(RequestCondition {
                type_,
                status: "True".to_string(),
                reason: Some("TestSigner".to_string()),
                message: Some(message.to_string()),
                last_update_time: Some(Utc::now()),
            }),
        }
        updated.resource_version = state.next_version();
        state.requests.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    async fn update(&self, request: &SigningRequest) -> Result<SigningRequest> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let Some(current) = state.requests.get_mut(&request.name) else {
            return Err(Error::NotFound {
                name: request.name.clone(),
            });
        };
        if current.resource_version != request.resource_version {
            return Err(Error::client(format!(
                "conflict on csr/{}: stale resource version",
                request.name
            )));
        }
        current.annotations = request.annotations.clone();
        current.resource_version = version;
        Ok(current.clone())
    }

    async fn update_approval(&self, request: &SigningRequest) -> Result<SigningRequest> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let Some(current) = state.requests.get_mut(&request.name) else {
            return Err(Error::NotFound {
                name: request.name.clone(),
            });
        };
        current.conditions = request.conditions.clone();
        current.resource_version = version;
        Ok(current.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.state.lock().unwrap().requests.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<SigningRequest>> {
        Ok(self.state.lock().unwrap().requests.values().cloned().collect())
    }
}

/// Self-signed PEM certificate for `common_name` expiring at `not_after`
pub fn certificate_pem(common_name: &str, not_after: DateTime<Utc>) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![format!("{common_name}.default.svc")]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let epoch = rcgen::date_time_ymd(1970, 1, 1);
    let secs = |t: DateTime<Utc>| std::time::Duration::from_secs(t.timestamp() as u64);
    params.not_before = epoch + secs(Utc::now() - chrono::Duration::hours(1));
    params.not_after = epoch + secs(not_after);
    params.self_signed(&key).unwrap().pem().into_bytes()
}

/// A spec for `svc-a` with its artifacts in `dir`
pub fn spec_in(dir: &Path, name: &str) -> SigningRequestSpec {
    let mut spec = SigningRequestSpec::new(name, "svc-a", dir);
    spec.add_subject_alternative_names(["svc-a.default.svc".to_string(), "10.0.0.1".to_string()]);
    spec
}

/// A request as the pipeline would submit it, ready to be seeded
pub fn submitted(name: &str) -> SigningRequest {
    SigningRequest::new(
        name,
        b"-----BEGIN CERTIFICATE REQUEST-----".to_vec(),
        "kubernetes.io/kube-apiserver-client",
        vec!["client auth".to_string()],
    )
}
