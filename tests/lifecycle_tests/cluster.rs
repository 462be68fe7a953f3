//! Issuance against a real cluster
//!
//! Needs a kubeconfig (or in-cluster credentials) allowed to create, approve
//! and delete CertificateSigningRequests, and a running signer for
//! `kubernetes.io/kube-apiserver-client` (kind and kubeadm clusters have one).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kube_csr::pipeline::{
    Approve, Delete, Fetch, FetchConfig, Generate, Pipeline, PipelineState, Submit,
};
use kube_csr::pki::{self, CertificateInfo};
use kube_csr::poll::Poller;
use kube_csr::renew::fresh_name;
use kube_csr::store::{create_client, KubeSigningRequestStore, SigningRequestStore};

use super::helpers::spec_in;

/// Story: a workload obtains a client certificate from the cluster CA
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn story_issue_against_cluster() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = create_client(None).await.unwrap();
    let store: Arc<dyn SigningRequestStore> = Arc::new(KubeSigningRequestStore::new(client));

    let dir = tempfile::tempdir().unwrap();
    let name = fresh_name("kube-csr-it");
    let mut spec = spec_in(dir.path(), &name);
    spec.usages = vec!["digital signature".to_string(), "client auth".to_string()];

    let fetch = FetchConfig {
        poller: Poller::new(Duration::from_secs(1), Duration::from_secs(30)).unwrap(),
        annotate: true,
        override_: false,
    };
    let mut pipeline = Pipeline::builder(spec)
        .generate(Generate::new())
        .submit(Submit::new(store.clone()))
        .approve(Approve::new(store.clone()))
        .fetch(Fetch::new(store.clone(), fetch))
        .delete(Delete::new(store.clone()))
        .build();

    let state = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(state, PipelineState::Deleted);

    let written = pki::read_file(&pipeline.spec().certificate.path).await.unwrap();
    let info = CertificateInfo::from_pem(&written).unwrap();
    assert!(info.subject.contains("svc-a"));
    assert!(store.get(&name).await.unwrap_err().is_not_found());
}
