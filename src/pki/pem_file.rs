//! PEM artifact persistence
//!
//! Local artifacts (private key, CSR, certificate) are never silently
//! replaced: a write to an existing path fails with `FileExists` unless the
//! caller asked to override.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Error, Result};

/// Fail with `FileExists` when `path` exists and `override_` is off
pub async fn ensure_writable(path: &Path, override_: bool) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(_) if !override_ => Err(Error::FileExists {
            path: path.to_path_buf(),
        }),
        Ok(_) => {
            debug!(path = %path.display(), "overriding existing file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Write raw bytes to `path` with unix permissions `mode`
pub async fn write_file(contents: &[u8], path: &Path, mode: u32, override_: bool) -> Result<()> {
    ensure_writable(path, override_).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::io(path, e))?;
    file.flush().await.map_err(|e| Error::io(path, e))?;

    // Mode only applies on creation
    tokio::fs::set_permissions(path, Permissions::from_mode(mode))
        .await
        .map_err(|e| Error::io(path, e))?;

    debug!(path = %path.display(), bytes = contents.len(), "wrote file");
    Ok(())
}

/// Encode DER bytes as a PEM block and write it to `path`
pub async fn write_pem_file(
    der: &[u8],
    label: &str,
    path: &Path,
    mode: u32,
    override_: bool,
) -> Result<()> {
    let encoded = ::pem::encode(&::pem::Pem::new(label, der.to_vec()));
    write_file(encoded.as_bytes(), path, mode, override_).await
}

/// Read a whole file
pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| Error::io(path, e))
}

/// Read a PEM file and return the DER contents of its first block
///
/// The block label must be `label`.
pub async fn read_pem_file(path: &Path, label: &str) -> Result<Vec<u8>> {
    let raw = read_file(path).await?;
    let block = ::pem::parse(&raw)
        .map_err(|e| Error::pki(format!("failed to parse PEM {}: {e}", path.display())))?;
    if block.tag() != label {
        return Err(Error::pki(format!(
            "unexpected PEM block {} in {}, expected {label}",
            block.tag(),
            path.display()
        )));
    }
    Ok(block.into_contents())
}
