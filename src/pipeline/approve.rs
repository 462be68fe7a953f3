//! Approve stage: append an Approved condition

use std::sync::Arc;

use tracing::info;

use crate::store::{RequestCondition, SigningRequest, SigningRequestStore};
use crate::Result;

/// Approves a signing request through the approval subresource
pub struct Approve {
    store: Arc<dyn SigningRequestStore>,
}

impl Approve {
    /// Create the stage
    pub fn new(store: Arc<dyn SigningRequestStore>) -> Self {
        Self { store }
    }

    /// Approve `submitted`, or the request named `name` when nothing was just submitted
    ///
    /// An already approved request is left untouched.
    pub async fn run(&self, name: &str, submitted: Option<SigningRequest>) -> Result<SigningRequest> {
        let mut request = match submitted {
            Some(r) => r,
            None => self.store.get(name).await?,
        };

        if request.is_approved() {
            info!(csr = %name, uid = %request.uid(), "csr already approved");
            return Ok(request);
        }

        request.conditions.push(RequestCondition::approved_now());
        let approved = self.store.update_approval(&request).await?;
        info!(csr = %name, uid = %approved.uid(), "csr approved");
        Ok(approved)
    }
}
