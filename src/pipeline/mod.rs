//! Certificate issuance pipeline
//!
//! A [`Pipeline`] holds up to six optional stages and runs the configured ones
//! strictly in order, stopping at the first error:
//!
//! ```text
//! Query -> Generate -> Submit -> Approve -> Fetch -> Delete
//! ```
//!
//! Stages share the [`SigningRequestSpec`]. Query appends the SANs it
//! discovers before Generate consumes them, Submit hands the created resource
//! to Approve, and a renewal renames the spec between runs.

pub mod approve;
pub mod delete;
pub mod fetch;
pub mod generate;
pub mod query;
pub mod submit;

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::metrics::{self, RunResult};
use crate::Result;

pub use approve::Approve;
pub use delete::Delete;
pub use fetch::{Fetch, FetchConfig};
pub use generate::Generate;
pub use query::{current_namespace, Query, QueryConfig, ServiceRef};
pub use submit::Submit;

/// Signer used when none is configured
pub const DEFAULT_SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";

/// Key usages requested when none are configured
pub const DEFAULT_USAGES: [&str; 4] = [
    "digital signature",
    "key encipherment",
    "server auth",
    "client auth",
];

/// Default unix permissions of every local artifact
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// A local file produced or consumed by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    /// Absolute path
    pub path: PathBuf,
    /// Unix permissions applied on write
    pub mode: u32,
}

impl ArtifactFile {
    /// Artifact at `path` with the default mode
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: DEFAULT_FILE_MODE,
        }
    }
}

/// Local description of the certificate to obtain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequestSpec {
    /// Name of the remote signing request
    pub name: String,
    /// Subject common name
    pub common_name: String,
    /// Hosts the certificate must be valid for, without duplicates
    pub subject_alternative_names: Vec<String>,
    /// RSA key size for a generated key
    pub key_bits: u32,
    /// Reuse the key found at `private_key` instead of generating one
    pub load_private_key: bool,
    /// Private key file
    pub private_key: ArtifactFile,
    /// CSR file
    pub csr: ArtifactFile,
    /// Certificate file
    pub certificate: ArtifactFile,
    /// Replace existing local files and remote signing requests
    pub override_: bool,
    /// Signer the request is addressed to
    pub signer_name: String,
    /// Requested key usages
    pub usages: Vec<String>,
}

impl SigningRequestSpec {
    /// A spec with default key size, signer, usages and artifact names in `dir`
    pub fn new(
        name: impl Into<String>,
        common_name: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        let dir = dir.into();
        Self {
            name: name.into(),
            common_name: common_name.into(),
            subject_alternative_names: Vec::new(),
            key_bits: 2048,
            load_private_key: false,
            private_key: ArtifactFile::new(dir.join("kube-csr.private_key")),
            csr: ArtifactFile::new(dir.join("kube-csr.csr")),
            certificate: ArtifactFile::new(dir.join("kube-csr.certificate")),
            override_: false,
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            usages: DEFAULT_USAGES.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// Append hosts that are not already present, keeping their order
    ///
    /// Returns how many were added.
    pub fn add_subject_alternative_names<I>(&mut self, names: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.subject_alternative_names.len();
        for name in names {
            if !self.subject_alternative_names.contains(&name) {
                self.subject_alternative_names.push(name);
            }
        }
        self.subject_alternative_names.len() - before
    }
}

/// Last stage a pipeline run completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing ran yet
    Idle,
    /// Service SANs were discovered
    Queried,
    /// Key and CSR were written
    Generated,
    /// The signing request was created
    Submitted,
    /// The signing request was approved
    Approved,
    /// The certificate was written
    Fetched,
    /// The signing request was deleted
    Deleted,
    /// A stage failed
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Queried => "Queried",
            Self::Generated => "Generated",
            Self::Submitted => "Submitted",
            Self::Approved => "Approved",
            Self::Fetched => "Fetched",
            Self::Deleted => "Deleted",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Ordered set of optional stages sharing one spec
pub struct Pipeline {
    spec: SigningRequestSpec,
    query: Option<Query>,
    generate: Option<Generate>,
    submit: Option<Submit>,
    approve: Option<Approve>,
    fetch: Option<Fetch>,
    delete: Option<Delete>,
    state: PipelineState,
}

impl Pipeline {
    /// Start assembling a pipeline for `spec`
    pub fn builder(spec: SigningRequestSpec) -> PipelineBuilder {
        PipelineBuilder {
            pipeline: Pipeline {
                spec,
                query: None,
                generate: None,
                submit: None,
                approve: None,
                fetch: None,
                delete: None,
                state: PipelineState::Idle,
            },
        }
    }

    /// The shared spec
    pub fn spec(&self) -> &SigningRequestSpec {
        &self.spec
    }

    /// The shared spec, for renames between runs
    pub fn spec_mut(&mut self) -> &mut SigningRequestSpec {
        &mut self.spec
    }

    /// State reached by the latest run
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether a Submit stage is configured
    pub fn has_submit(&self) -> bool {
        self.submit.is_some()
    }

    /// The Fetch stage, if configured
    pub fn fetch_mut(&mut self) -> Option<&mut Fetch> {
        self.fetch.as_mut()
    }

    /// Run every configured stage in order
    ///
    /// Returns the last state reached, or the first error met (the pipeline
    /// state is then [`PipelineState::Failed`]).
    #[instrument(skip(self, cancel), fields(csr = %self.spec.name))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<PipelineState> {
        self.state = PipelineState::Idle;
        match self.run_stages(cancel).await {
            Ok(()) => {
                metrics::record_issued(RunResult::Success);
                info!(state = %self.state, "pipeline completed");
                Ok(self.state)
            }
            Err(e) => {
                let reached = self.state;
                self.state = PipelineState::Failed;
                metrics::record_issued(RunResult::Error);
                error!(error = %e, after = %reached, "pipeline failed");
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(query) = &self.query {
            let sans = query.run(cancel).await?;
            let added = self.spec.add_subject_alternative_names(sans);
            info!(added, total = self.spec.subject_alternative_names.len(), "appended service SANs");
            self.state = PipelineState::Queried;
        }

        if let Some(generate) = &self.generate {
            generate.run(&self.spec).await?;
            self.state = PipelineState::Generated;
        }

        let mut submitted = None;
        if let Some(submit) = &self.submit {
            submitted = Some(submit.run(&self.spec).await?);
            self.state = PipelineState::Submitted;
        }

        // Approval is decided per run so a renewal approves its new request too
        if let Some(approve) = &self.approve {
            approve.run(&self.spec.name, submitted.take()).await?;
            self.state = PipelineState::Approved;
        }

        if let Some(fetch) = &self.fetch {
            fetch.run(&self.spec, cancel).await?;
            self.state = PipelineState::Fetched;
        }

        if let Some(delete) = &self.delete {
            delete.run(&self.spec.name).await?;
            self.state = PipelineState::Deleted;
        }

        Ok(())
    }
}

/// Assembles a [`Pipeline`] from the stages a caller needs
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    /// Discover SANs from Services before generating
    pub fn query(mut self, query: Query) -> Self {
        self.pipeline.query = Some(query);
        self
    }

    /// Generate the key and CSR
    pub fn generate(mut self, generate: Generate) -> Self {
        self.pipeline.generate = Some(generate);
        self
    }

    /// Create the remote signing request
    pub fn submit(mut self, submit: Submit) -> Self {
        self.pipeline.submit = Some(submit);
        self
    }

    /// Approve the remote signing request
    pub fn approve(mut self, approve: Approve) -> Self {
        self.pipeline.approve = Some(approve);
        self
    }

    /// Wait for and write the certificate
    pub fn fetch(mut self, fetch: Fetch) -> Self {
        self.pipeline.fetch = Some(fetch);
        self
    }

    /// Delete the remote signing request
    pub fn delete(mut self, delete: Delete) -> Self {
        self.pipeline.delete = Some(delete);
        self
    }

    /// Finish the pipeline
    ///
    /// With a Delete stage the resource is gone right after the fetch, so the
    /// fetch annotations are not written.
    pub fn build(mut self) -> Pipeline {
        let deleting = self.pipeline.delete.is_some();
        if let Some(fetch) = self.pipeline.fetch.as_mut() {
            if deleting && fetch.config().annotate {
                info!(
                    csr = %self.pipeline.spec.name,
                    "delete stage configured, fetch will not annotate"
                );
                fetch.config_mut().annotate = false;
            }
        }
        self.pipeline
    }
}
