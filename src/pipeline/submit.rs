//! Submit stage: create the remote signing request

use std::sync::Arc;

use tracing::{info, warn};

use super::SigningRequestSpec;
use crate::pki;
use crate::store::{SigningRequest, SigningRequestStore};
use crate::Result;

/// Creates the signing request from the local CSR file
pub struct Submit {
    store: Arc<dyn SigningRequestStore>,
}

impl Submit {
    /// Create the stage
    pub fn new(store: Arc<dyn SigningRequestStore>) -> Self {
        Self { store }
    }

    /// Create the signing request named after the spec
    ///
    /// A name collision fails with `AlreadyExists` unless the spec allows
    /// override, in which case the existing request is deleted and recreated
    /// with an empty history.
    pub async fn run(&self, spec: &SigningRequestSpec) -> Result<SigningRequest> {
        let csr = pki::read_file(&spec.csr.path).await?;
        let request =
            SigningRequest::new(&spec.name, csr, &spec.signer_name, spec.usages.clone());

        let created = match self.store.create(&request).await {
            Err(e) if e.is_already_exists() && spec.override_ => {
                warn!(csr = %spec.name, "csr already exists, deleting it before recreating");
                self.store.delete(&spec.name).await?;
                self.store.create(&request).await?
            }
            other => other?,
        };

        info!(csr = %created.name, uid = %created.uid(), signer = %created.signer_name, "csr submitted");
        Ok(created)
    }
}
