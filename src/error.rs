//! Error types for kube-csr
//!
//! Every stage of the certificate lifecycle surfaces the first error it meets.
//! Variants are structured so callers can tell an operator-initiated shutdown
//! (`Cancelled`) from a real deadline miss (`Timeout`), and a name collision
//! that `--override` would resolve (`AlreadyExists`, `FileExists`) from a
//! terminal authority decision (`Denied`).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for kube-csr operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A signing request with the same name already exists remotely
    #[error("csr/{name} already exists, use override or delete it before")]
    AlreadyExists {
        /// Name of the colliding signing request
        name: String,
    },

    /// A local artifact already exists and override is not set
    #[error("file exists {}", path.display())]
    FileExists {
        /// Path of the existing file
        path: PathBuf,
    },

    /// The signing request does not exist remotely
    #[error("csr/{name} not found")]
    NotFound {
        /// Name of the missing signing request
        name: String,
    },

    /// The authority rejected the signing request
    #[error("csr/{name} uid: {uid} is \"{condition}\": {message}")]
    Denied {
        /// Name of the signing request
        name: String,
        /// Remote uid of the signing request
        uid: String,
        /// Condition type that made the request terminal (Denied or Failed)
        condition: String,
        /// Reason and message reported by the authority
        message: String,
    },

    /// A polling deadline was exceeded
    #[error("timeout of {} reached during {operation}", humanize(*after))]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The configured timeout
        after: Duration,
    },

    /// An external cancellation signal stopped a wait
    #[error("{operation} cancelled")]
    Cancelled {
        /// What was being waited for
        operation: String,
    },

    /// Malformed input or configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Connectivity, authentication or any other API failure
    #[error("remote error [{context}]: {source}")]
    RemoteUnavailable {
        /// Operation that failed (e.g. "create csr/foo")
        context: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// The kubeconfig or in-cluster configuration could not be loaded
    #[error("client error: {message}")]
    Client {
        /// Description of what failed
        message: String,
    },

    /// Key, CSR or certificate processing failed
    #[error("pki error: {message}")]
    Pki {
        /// Description of what failed
        message: String,
    },

    /// Local file error
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The post-renewal command failed
    #[error("renew command {command:?} failed: {message}")]
    Hook {
        /// The shell command
        command: String,
        /// Exit status or spawn error
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki {
            message: msg.into(),
        }
    }

    /// Create a client construction error with the given message
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client {
            message: msg.into(),
        }
    }

    /// Wrap a kube-rs error that isn't about a specific signing request
    pub fn remote(context: impl Into<String>, source: kube::Error) -> Self {
        Self::RemoteUnavailable {
            context: context.into(),
            source,
        }
    }

    /// Create a timeout error for the given operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a cancellation error for the given operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Wrap an IO error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map a kube-rs error for the signing request `name`
    ///
    /// 404 becomes `NotFound` and 409 AlreadyExists becomes `AlreadyExists`.
    /// Everything else, including 409 Conflict on a stale update, is a remote failure.
    pub fn from_kube(name: &str, context: impl Into<String>, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    name: name.to_string(),
                }
            }
            _ => Self::remote(context, source),
        }
    }

    /// True for remote and local name collisions (recoverable with override)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. } | Self::FileExists { .. })
    }

    /// True when the remote resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when a wait was interrupted by a cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// True when a polling deadline was exceeded
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Format a duration the way it is given on the command line (e.g. `1h0m0s`)
pub fn humanize(d: Duration) -> String {
    let total = d.as_secs();
    let millis = d.subsec_millis();
    if total == 0 {
        return format!("{millis}ms");
    }
    let (h, m) = (total / 3600, (total % 3600) / 60);
    let s = if millis == 0 {
        format!("{}s", total % 60)
    } else {
        let fraction = format!("{millis:03}");
        format!("{}.{}s", total % 60, fraction.trim_end_matches('0'))
    };
    if h > 0 {
        format!("{h}h{m}m{s}")
    } else if m > 0 {
        format!("{m}m{s}")
    } else {
        s
    }
}
