//! Fetch stage: poll for the issued certificate
//!
//! Each poll reads the signing request by name. A present certificate is
//! written locally (after the fetch annotations are stamped, when enabled).
//! A Denied or Failed condition ends polling with an error, anything else
//! means the authority has not answered yet.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::SigningRequestSpec;
use crate::error::humanize;
use crate::pki;
use crate::poll::Poller;
use crate::store::{ConditionType, SigningRequest, SigningRequestStore, FETCH_COUNT_ANNOTATION};
use crate::{Error, Result};

/// Fetch polling and write behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchConfig {
    /// Polling interval and timeout
    pub poller: Poller,
    /// Stamp `fetchCount` and `lastFetchTime` on the signing request
    pub annotate: bool,
    /// Replace an existing certificate file
    pub override_: bool,
}

/// Waits for the certificate and writes it to the spec's certificate path
pub struct Fetch {
    store: Arc<dyn SigningRequestStore>,
    config: FetchConfig,
}

impl Fetch {
    /// Create the stage
    pub fn new(store: Arc<dyn SigningRequestStore>, config: FetchConfig) -> Self {
        Self { store, config }
    }

    /// Current configuration
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Mutable configuration
    pub fn config_mut(&mut self) -> &mut FetchConfig {
        &mut self.config
    }

    /// Poll until the certificate is issued, then write it
    #[instrument(skip_all, fields(csr = %spec.name))]
    pub async fn run(
        &self,
        spec: &SigningRequestSpec,
        cancel: &CancellationToken,
    ) -> Result<SigningRequest> {
        info!(
            "start polling for certificate of csr/{}, every {}, timeout after {}",
            spec.name,
            humanize(self.config.poller.interval),
            humanize(self.config.poller.timeout)
        );

        let operation = format!("certificate fetching of csr/{}", spec.name);
        let fetched = self
            .config
            .poller
            .poll(&operation, cancel, || self.poll_once(&spec.name))
            .await?;

        let certificate = fetched.certificate().unwrap_or_default();
        info!(
            bytes = certificate.len(),
            path = %spec.certificate.path.display(),
            "certificate fetched, writing"
        );
        pki::write_file(
            certificate,
            &spec.certificate.path,
            spec.certificate.mode,
            self.config.override_,
        )
        .await?;

        Ok(fetched)
    }

    async fn poll_once(&self, name: &str) -> Result<Option<SigningRequest>> {
        let mut request = self.store.get(name).await?;

        if request.certificate().is_some() {
            if !self.config.annotate {
                debug!(csr = %name, "skipping fetch annotations");
                return Ok(Some(request));
            }
            if request.fetch_count().is_none() {
                warn!(
                    csr = %name,
                    value = ?request.annotations.get(FETCH_COUNT_ANNOTATION),
                    "cannot parse {FETCH_COUNT_ANNOTATION}, restarting count"
                );
            }
            request.record_fetch(Utc::now());
            let updated = self.store.update(&request).await?;
            debug!(
                csr = %name,
                count = ?updated.fetch_count(),
                "fetch annotations updated"
            );
            // The authority may omit the certificate on update responses
            if updated.certificate().is_some() {
                return Ok(Some(updated));
            }
            return Ok(Some(request));
        }

        if let Some(terminal) = request
            .conditions
            .iter()
            .find(|c| matches!(c.type_, ConditionType::Denied | ConditionType::Failed))
        {
            return Err(Error::Denied {
                name: name.to_string(),
                uid: request.uid().to_string(),
                condition: terminal.type_.as_str().to_string(),
                message: terminal.describe(),
            });
        }

        debug!(
            csr = %name,
            next_in = %humanize(self.config.poller.interval),
            "certificate still not available"
        );
        Ok(None)
    }
}
