//! Stories about renewing a certificate before it expires

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use kube_csr::pipeline::{Approve, Fetch, FetchConfig, Generate, Pipeline, Submit};
use kube_csr::pki::{self, CertificateInfo};
use kube_csr::poll::Poller;
use kube_csr::renew::{RenewConfig, RenewalScheduler};

use super::helpers::{certificate_pem, spec_in, InMemoryStore, Reaction};

fn renew_config(threshold: Duration) -> RenewConfig {
    RenewConfig {
        threshold,
        check_interval: Duration::from_secs(15 * 60),
        command: None,
        exit_on_renew: true,
        generate_fresh_name: true,
    }
}

/// Issue a certificate expiring in 30 minutes and return the renewing pipeline
async fn issued(dir: &std::path::Path, store: Arc<InMemoryStore>) -> Pipeline {
    let spec = spec_in(dir, "svc-a");
    Generate::new().run(&spec).await.unwrap();
    pki::write_file(
        &certificate_pem("svc-a", Utc::now() + chrono::Duration::minutes(30)),
        &spec.certificate.path,
        spec.certificate.mode,
        false,
    )
    .await
    .unwrap();

    let fetch = FetchConfig {
        poller: Poller::new(Duration::from_millis(10), Duration::from_secs(2)).unwrap(),
        annotate: true,
        override_: false,
    };
    Pipeline::builder(spec)
        .submit(Submit::new(store.clone()))
        .approve(Approve::new(store.clone()))
        .fetch(Fetch::new(store, fetch))
        .build()
}

/// Story: 30 minutes left with a one hour threshold renews under a fresh name
#[tokio::test]
async fn story_renews_certificate_within_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let renewed = certificate_pem("svc-a", Utc::now() + chrono::Duration::days(30));
    let store = Arc::new(InMemoryStore::with_signer(move |request, _| {
        if request.is_approved() {
            Reaction::Sign(renewed.clone())
        } else {
            Reaction::Nothing
        }
    }));
    let pipeline = issued(dir.path(), store.clone()).await;

    let mut scheduler =
        RenewalScheduler::new(pipeline, renew_config(Duration::from_secs(3600))).unwrap();
    assert!(scheduler.should_renew().await.unwrap());
    scheduler.run(&CancellationToken::new()).await.unwrap();

    let names = store.names();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("svc-a-"));
    assert_eq!(names[0].len(), "svc-a-".len() + 13);
    assert_eq!(scheduler.pipeline().spec().name, names[0]);

    let written = pki::read_file(&scheduler.pipeline().spec().certificate.path)
        .await
        .unwrap();
    let info = CertificateInfo::from_pem(&written).unwrap();
    assert!(info.time_left(Utc::now()) > chrono::Duration::days(29));
    assert!(!scheduler.should_renew().await.unwrap());
}

/// Story: 30 minutes left with a ten minute threshold waits until cancelled
#[tokio::test]
async fn story_no_renewal_outside_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let pipeline = issued(dir.path(), store.clone()).await;

    let mut scheduler =
        RenewalScheduler::new(pipeline, renew_config(Duration::from_secs(600))).unwrap();
    assert!(!scheduler.should_renew().await.unwrap());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    scheduler.run(&cancel).await.unwrap();
    assert!(store.names().is_empty());
}

/// Story: the renewal hook runs after every renewal
#[tokio::test]
async fn story_renewal_runs_hook() {
    let dir = tempfile::tempdir().unwrap();
    let renewed = certificate_pem("svc-a", Utc::now() + chrono::Duration::days(30));
    let store = Arc::new(InMemoryStore::with_signer(move |request, _| {
        if request.is_approved() {
            Reaction::Sign(renewed.clone())
        } else {
            Reaction::Nothing
        }
    }));
    let pipeline = issued(dir.path(), store.clone()).await;
    let marker = dir.path().join("reloaded");

    let mut config = renew_config(Duration::from_secs(3600));
    config.command = Some(format!("touch {}", marker.display()));
    config.generate_fresh_name = false;
    RenewalScheduler::new(pipeline, config)
        .unwrap()
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(marker.exists());
    assert_eq!(store.names(), vec!["svc-a"]);
}

/// Story: renewal refuses to start without its artifacts
#[tokio::test]
async fn story_renewal_requires_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let pipeline = Pipeline::builder(spec_in(dir.path(), "svc-a"))
        .submit(Submit::new(store.clone()))
        .fetch(Fetch::new(
            store,
            FetchConfig {
                poller: Poller::new(Duration::from_secs(1), Duration::from_secs(10)).unwrap(),
                annotate: true,
                override_: false,
            },
        ))
        .build();

    let err = RenewalScheduler::new(pipeline, renew_config(Duration::from_secs(3600)))
        .err()
        .unwrap();
    assert!(err.to_string().contains("kube-csr.certificate"));
}
