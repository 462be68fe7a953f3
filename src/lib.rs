//! kube-csr - certificate lifecycle through the Kubernetes CSR API
//!
//! kube-csr obtains X.509 certificates for workloads that cannot talk to a PKI
//! directly. It generates a key and CSR, submits it as a
//! `certificates.k8s.io/v1` CertificateSigningRequest, optionally approves it,
//! waits for the signed certificate and writes it next to the key.
//!
//! # Architecture
//!
//! - A [`pipeline::Pipeline`] sequences the optional stages
//!   (query, generate, submit, approve, fetch, delete) for one run
//! - A [`renew::RenewalScheduler`] re-runs the pipeline before the
//!   certificate expires
//! - A [`gc::GarbageCollector`] removes stale signing requests
//!
//! All of them talk to the cluster through [`store::SigningRequestStore`].
//!
//! # Modules
//!
//! - [`store`] - Signing request model and the kube-backed store
//! - [`poll`] - Interval polling with deadline and cancellation
//! - [`pki`] - Key, CSR and certificate handling, PEM files
//! - [`pipeline`] - Issuance stages and their sequencing
//! - [`gc`] - Garbage collection and its predicates
//! - [`renew`] - Renewal scheduler
//! - [`cli`] - Command line arguments and their conversion into configs
//! - [`metrics`] / [`telemetry`] - Observability
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cli;
pub mod error;
pub mod gc;
pub mod metrics;
pub mod pipeline;
pub mod pki;
pub mod poll;
pub mod renew;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
