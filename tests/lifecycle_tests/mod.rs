//! Stories about the certificate lifecycle
//!
//! - `issuance`: generate, submit, approve, fetch and delete through the pipeline
//! - `garbage_collection`: stale signing requests removed by the collector
//! - `renewal`: the scheduler renewing a certificate close to its expiry
//! - `cluster`: the whole issuance against a real cluster (ignored)

mod cluster;
mod helpers;
mod issuance;
mod renewal;
