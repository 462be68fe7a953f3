//! Generate stage: local key and CSR artifacts

use tracing::info;

use super::SigningRequestSpec;
use crate::pki::{self, CsrRequest, CSR_LABEL, PRIVATE_KEY_LABEL};
use crate::{Error, Result};

/// Writes the private key and the CSR described by the spec
#[derive(Debug, Clone, Copy, Default)]
pub struct Generate;

impl Generate {
    /// Create the stage
    pub fn new() -> Self {
        Self
    }

    /// Generate (or load) the key, build the CSR and write both
    ///
    /// With `load_private_key` the existing key is reused and not rewritten.
    /// Every target path is checked before anything is written, so a
    /// collision leaves no CSR behind for a key that was never stored.
    pub async fn run(&self, spec: &SigningRequestSpec) -> Result<()> {
        pki::ensure_writable(&spec.csr.path, spec.override_).await?;
        let existing_key = if spec.load_private_key {
            info!(path = %spec.private_key.path.display(), "loading existing private key");
            Some(pki::read_private_key(&spec.private_key.path).await?)
        } else {
            pki::ensure_writable(&spec.private_key.path, spec.override_).await?;
            None
        };

        let common_name = spec.common_name.clone();
        let hosts = spec.subject_alternative_names.clone();
        let key_bits = spec.key_bits;
        // RSA generation is CPU bound
        let generated = tokio::task::spawn_blocking(move || {
            pki::generate_key_and_csr(&CsrRequest {
                common_name: &common_name,
                hosts: &hosts,
                key_bits,
                existing_key: existing_key.as_deref(),
            })
        })
        .await
        .map_err(|e| Error::pki(format!("key generation task failed: {e}")))??;

        // Key first: a CSR on disk always has its key next to it
        if !spec.load_private_key {
            pki::write_pem_file(
                &generated.private_key_der,
                PRIVATE_KEY_LABEL,
                &spec.private_key.path,
                spec.private_key.mode,
                spec.override_,
            )
            .await?;
            info!(path = %spec.private_key.path.display(), "wrote private key");
        }

        pki::write_pem_file(
            &generated.csr_der,
            CSR_LABEL,
            &spec.csr.path,
            spec.csr.mode,
            spec.override_,
        )
        .await?;
        info!(path = %spec.csr.path.display(), "wrote CSR");

        Ok(())
    }
}
