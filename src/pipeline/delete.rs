//! Delete stage

use std::sync::Arc;

use tracing::info;

use crate::store::SigningRequestStore;
use crate::Result;

/// Removes the remote signing request once the certificate is local
pub struct Delete {
    store: Arc<dyn SigningRequestStore>,
}

impl Delete {
    /// Create the stage
    pub fn new(store: Arc<dyn SigningRequestStore>) -> Self {
        Self { store }
    }

    /// Delete the request named `name`
    pub async fn run(&self, name: &str) -> Result<()> {
        self.store.delete(name).await?;
        info!(csr = %name, "csr deleted");
        Ok(())
    }
}
