//! Stories about issuing a certificate through the pipeline

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kube_csr::pipeline::{
    Approve, Delete, Fetch, FetchConfig, Generate, Pipeline, PipelineState, Submit,
};
use kube_csr::pki::{self, CertificateInfo};
use kube_csr::poll::Poller;
use kube_csr::store::{
    ConditionType, SigningRequestStore, FETCH_COUNT_ANNOTATION, FETCH_TIME_FORMAT,
    LAST_FETCH_TIME_ANNOTATION,
};
use kube_csr::Error;

use super::helpers::{certificate_pem, spec_in, submitted, InMemoryStore, Reaction};

fn fetch_config(interval_ms: u64, timeout_ms: u64) -> FetchConfig {
    FetchConfig {
        poller: Poller::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
        .unwrap(),
        annotate: true,
        override_: true,
    }
}

/// Signs a request once it carries an Approved condition
fn approving_signer() -> InMemoryStore {
    let certificate = certificate_pem("svc-a", Utc::now() + chrono::Duration::days(30));
    InMemoryStore::with_signer(move |request, _| {
        if request.is_approved() {
            Reaction::Sign(certificate.clone())
        } else {
            Reaction::Nothing
        }
    })
}

// =============================================================================
// Submission
// =============================================================================

/// Story: a fresh submission is created with a uid and an empty history
#[tokio::test]
async fn story_fresh_submission_has_empty_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let mut pipeline = Pipeline::builder(spec_in(dir.path(), "svc-a"))
        .generate(Generate::new())
        .submit(Submit::new(store.clone()))
        .build();

    let state = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(state, PipelineState::Submitted);

    let remote = store.snapshot("svc-a").unwrap();
    assert!(!remote.uid().is_empty());
    assert!(remote.conditions.is_empty());
    assert!(remote.annotations.is_empty());
    assert!(remote.certificate().is_none());
    assert_eq!(remote.request, pki::read_file(&dir.path().join("kube-csr.csr")).await.unwrap());
}

/// Story: resubmitting the same name needs override, which starts a new history
#[tokio::test]
async fn story_resubmission_requires_override() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let spec = spec_in(dir.path(), "svc-a");

    Generate::new().run(&spec).await.unwrap();
    let first = Submit::new(store.clone()).run(&spec).await.unwrap();
    Approve::new(store.clone())
        .run("svc-a", Some(first.clone()))
        .await
        .unwrap();
    assert!(store.snapshot("svc-a").unwrap().is_approved());

    let err = Submit::new(store.clone()).run(&spec).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));

    let mut overriding = spec.clone();
    overriding.override_ = true;
    let second = Submit::new(store.clone()).run(&overriding).await.unwrap();
    assert_ne!(second.uid(), first.uid());

    let remote = store.snapshot("svc-a").unwrap();
    assert_eq!(remote.uid(), second.uid());
    assert!(remote.conditions.is_empty());
}

/// Story: generated artifacts are never overwritten without override
#[tokio::test]
async fn story_generate_keeps_existing_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec_in(dir.path(), "svc-a");
    Generate::new().run(&spec).await.unwrap();
    let csr = pki::read_file(&spec.csr.path).await.unwrap();

    let err = Generate::new().run(&spec).await.unwrap_err();
    assert!(matches!(err, Error::FileExists { .. }));
    assert_eq!(pki::read_file(&spec.csr.path).await.unwrap(), csr);
}

// =============================================================================
// Fetching
// =============================================================================

/// Story: the certificate shows up on the third poll, three seconds in
#[tokio::test(start_paused = true)]
async fn story_certificate_fetched_on_third_poll() {
    let dir = tempfile::tempdir().unwrap();
    let certificate = certificate_pem("svc-a", Utc::now() + chrono::Duration::days(1));
    let store = Arc::new(InMemoryStore::with_signer(move |_, gets| {
        if gets >= 3 {
            Reaction::Sign(certificate.clone())
        } else {
            Reaction::Nothing
        }
    }));
    store.seed(submitted("svc-a"));

    let spec = spec_in(dir.path(), "svc-a");
    let fetch = Fetch::new(store.clone(), fetch_config(1_000, 10_000));
    let started = Instant::now();
    let fetched = fetch.run(&spec, &CancellationToken::new()).await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(store.gets("svc-a"), 3);
    assert_eq!(fetched.fetch_count(), Some(1));
    let remote = store.snapshot("svc-a").unwrap();
    assert_eq!(remote.annotations[FETCH_COUNT_ANNOTATION], "1");
    assert!(remote.annotations.contains_key(LAST_FETCH_TIME_ANNOTATION));

    let written = pki::read_file(&spec.certificate.path).await.unwrap();
    assert!(CertificateInfo::from_pem(&written).unwrap().subject.contains("svc-a"));
}

/// Story: a request denied before any certificate fails the fetch at once
#[tokio::test(start_paused = true)]
async fn story_denied_request_stops_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::with_signer(|request, _| {
        if request.conditions.is_empty() {
            Reaction::Reject(ConditionType::Denied, "not allowed")
        } else {
            Reaction::Nothing
        }
    }));
    store.seed(submitted("svc-a"));

    let spec = spec_in(dir.path(), "svc-a");
    let started = Instant::now();
    let err = Fetch::new(store.clone(), fetch_config(1_000, 10_000))
        .run(&spec, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_secs(1));
    match err {
        Error::Denied { name, message, .. } => {
            assert_eq!(name, "svc-a");
            assert!(message.contains("not allowed"));
        }
        other => panic!("expected Denied, got {other:?}"),
    }
    assert!(!spec.certificate.path.exists());
}

/// Story: a request failed by the signer is reported like a denial
#[tokio::test(start_paused = true)]
async fn story_failed_request_stops_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::with_signer(|_, _| {
        Reaction::Reject(ConditionType::Failed, "signer unavailable")
    }));
    store.seed(submitted("svc-a"));

    let err = Fetch::new(store.clone(), fetch_config(1_000, 10_000))
        .run(&spec_in(dir.path(), "svc-a"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Denied { condition, .. } if condition.contains("Failed")));
}

/// Story: nobody signs, the fetch gives up at its timeout
#[tokio::test(start_paused = true)]
async fn story_unsigned_request_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    store.seed(submitted("svc-a"));

    let started = Instant::now();
    let err = Fetch::new(store.clone(), fetch_config(1_000, 10_000))
        .run(&spec_in(dir.path(), "svc-a"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

/// Story: every fetch cycle bumps the count and stamps the time
#[tokio::test]
async fn story_fetch_count_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let certificate = certificate_pem("svc-a", Utc::now() + chrono::Duration::days(1));
    let store = Arc::new(InMemoryStore::with_signer(move |_, _| {
        Reaction::Sign(certificate.clone())
    }));
    store.seed(submitted("svc-a"));

    let spec = spec_in(dir.path(), "svc-a");
    let fetch = Fetch::new(store.clone(), fetch_config(10, 2_000));
    let started = Utc::now() - chrono::Duration::seconds(1);
    let mut last_count = 0;
    for cycle in 1..=3u64 {
        let fetched = fetch.run(&spec, &CancellationToken::new()).await.unwrap();
        let count = fetched.fetch_count().unwrap();
        assert_eq!(count, cycle);
        assert!(count > last_count);
        last_count = count;
    }

    let remote = store.snapshot("svc-a").unwrap();
    assert_eq!(remote.annotations[FETCH_COUNT_ANNOTATION], "3");
    let stamped = remote.last_fetch_time().unwrap();
    assert!(stamped >= started);
    assert!(stamped <= Utc::now());
    assert_eq!(
        remote.annotations[LAST_FETCH_TIME_ANNOTATION],
        stamped.format(FETCH_TIME_FORMAT).to_string()
    );
}

// =============================================================================
// Whole pipeline
// =============================================================================

/// Story: generate, submit, approve and fetch in one run
#[tokio::test]
async fn story_full_issuance() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(approving_signer());
    let mut pipeline = Pipeline::builder(spec_in(dir.path(), "svc-a-node-1"))
        .generate(Generate::new())
        .submit(Submit::new(store.clone()))
        .approve(Approve::new(store.clone()))
        .fetch(Fetch::new(store.clone(), fetch_config(10, 2_000)))
        .build();

    let state = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(state, PipelineState::Fetched);

    let remote = store.snapshot("svc-a-node-1").unwrap();
    assert_eq!(remote.conditions[0].type_, ConditionType::Approved);
    assert_eq!(remote.conditions[0].reason.as_deref(), Some("KubeCsrApprove"));
    assert_eq!(remote.fetch_count(), Some(1));

    let spec = pipeline.spec();
    for path in [&spec.private_key.path, &spec.csr.path, &spec.certificate.path] {
        assert!(path.exists(), "{} missing", path.display());
    }
}

/// Story: with delete, the request is removed right after the fetch
#[tokio::test]
async fn story_issuance_with_delete_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(approving_signer());
    let mut pipeline = Pipeline::builder(spec_in(dir.path(), "svc-a"))
        .generate(Generate::new())
        .submit(Submit::new(store.clone()))
        .approve(Approve::new(store.clone()))
        .fetch(Fetch::new(store.clone(), fetch_config(10, 2_000)))
        .delete(Delete::new(store.clone()))
        .build();

    let state = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(state, PipelineState::Deleted);
    assert!(store.names().is_empty());
    assert!(pipeline.spec().certificate.path.exists());
}

/// Story: a pipeline stops at the first failing stage
#[tokio::test]
async fn story_pipeline_stops_at_first_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    // No CSR on disk and no generate stage
    let mut pipeline = Pipeline::builder(spec_in(dir.path(), "svc-a"))
        .submit(Submit::new(store.clone()))
        .delete(Delete::new(store.clone()))
        .build();

    assert!(pipeline.run(&CancellationToken::new()).await.is_err());
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(store.list().await.unwrap().is_empty());
}
