//! Command line arguments
//!
//! clap parses the process arguments (or their `KUBE_CSR_*` environment
//! variables) into the structs below. They are converted once into the
//! component configs; nothing reads the arguments afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::gc::{GcConfig, PredicateKind};
use crate::pipeline::{
    FetchConfig, QueryConfig, ServiceRef, SigningRequestSpec, DEFAULT_SIGNER_NAME,
};
use crate::pki::SUPPORTED_KEY_BITS;
use crate::poll::Poller;
use crate::renew::RenewConfig;
use crate::{Error, Result};

/// kube-csr - certificates through the Kubernetes CSR API
#[derive(Parser, Debug)]
#[command(name = "kube-csr", version, about, long_about = None)]
pub struct Cli {
    /// Kubernetes config path, leave empty for in-cluster config
    #[arg(long, global = true, env = "KUBE_CSR_KUBECONFIG_PATH")]
    pub kubeconfig_path: Option<PathBuf>,

    /// Raise the log level, repeat for more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate, submit, approve, fetch and delete a signing request
    ///
    /// Examples:
    ///   kube-csr issue my-app -gsaf
    ///   kube-csr issue my-app -gsaf --subject-alternative-names 192.168.1.1,etcd-0.default.svc.cluster.local
    ///   kube-csr issue skydns --csr-name kv-etcd -gsafd --override
    ///   kube-csr issue my-app -gsaf --renew --renew-threshold 24h
    Issue(IssueArgs),

    /// Delete stale signing requests
    ///
    /// Examples:
    ///   kube-csr garbage-collect --fetched --grace-period 12h
    ///   kube-csr garbage-collect --denied --grace-period 15m
    ///   kube-csr garbage-collect --fetched --daemon --polling-period 10m --grace-period 1h
    GarbageCollect(GcArgs),
}

/// Issue arguments
#[derive(Args, Debug, Clone)]
pub struct IssueArgs {
    /// Common name of the certificate
    pub common_name: String,

    /// Kubernetes CSR name, leave empty for <common-name>-<hostname>
    #[arg(long, env = "KUBE_CSR_CSR_NAME")]
    pub csr_name: Option<String>,

    /// Hostname used in the default CSR name, leave empty for the machine hostname
    #[arg(long, env = "KUBE_CSR_HOSTNAME")]
    pub hostname: Option<String>,

    /// Override any existing file and Kubernetes CSR
    #[arg(long = "override", env = "KUBE_CSR_OVERRIDE")]
    pub override_: bool,

    /// Generate the private key and the CSR
    #[arg(short, long, env = "KUBE_CSR_GENERATE")]
    pub generate: bool,

    /// Reuse the private key found at --private-key-file
    #[arg(long, env = "KUBE_CSR_LOAD_PRIVATE_KEY")]
    pub load_private_key: bool,

    /// RSA bits of the generated private key
    #[arg(long, env = "KUBE_CSR_RSA_BITS", default_value_t = 2048, value_parser = parse_key_bits)]
    pub rsa_bits: u32,

    /// Subject Alternative Names, comma separated
    #[arg(long, env = "KUBE_CSR_SUBJECT_ALTERNATIVE_NAMES", value_delimiter = ',')]
    pub subject_alternative_names: Vec<String>,

    /// Private key file
    #[arg(long, env = "KUBE_CSR_PRIVATE_KEY_FILE", default_value = "kube-csr.private_key")]
    pub private_key_file: PathBuf,

    /// Private key file permissions
    #[arg(long, env = "KUBE_CSR_PRIVATE_KEY_PERM", default_value = "0600", value_parser = parse_mode)]
    pub private_key_perm: u32,

    /// CSR file
    #[arg(long, env = "KUBE_CSR_CSR_FILE", default_value = "kube-csr.csr")]
    pub csr_file: PathBuf,

    /// CSR file permissions
    #[arg(long, env = "KUBE_CSR_CSR_PERM", default_value = "0600", value_parser = parse_mode)]
    pub csr_perm: u32,

    /// Submit the CSR
    #[arg(short, long, env = "KUBE_CSR_SUBMIT")]
    pub submit: bool,

    /// Signer the CSR is addressed to
    #[arg(long, env = "KUBE_CSR_SIGNER_NAME", default_value = DEFAULT_SIGNER_NAME)]
    pub signer_name: String,

    /// Requested key usages, comma separated
    #[arg(
        long,
        env = "KUBE_CSR_USAGES",
        value_delimiter = ',',
        default_value = "digital signature,key encipherment,server auth,client auth"
    )]
    pub usages: Vec<String>,

    /// Approve the CSR
    #[arg(short, long, env = "KUBE_CSR_APPROVE")]
    pub approve: bool,

    /// Fetch the certificate
    #[arg(short, long, env = "KUBE_CSR_FETCH")]
    pub fetch: bool,

    /// Certificate file
    #[arg(long, env = "KUBE_CSR_CERTIFICATE_FILE", default_value = "kube-csr.certificate")]
    pub certificate_file: PathBuf,

    /// Certificate file permissions
    #[arg(long, env = "KUBE_CSR_CERTIFICATE_PERM", default_value = "0600", value_parser = parse_mode)]
    pub certificate_perm: u32,

    /// Polling interval of the certificate fetch
    #[arg(long, env = "KUBE_CSR_FETCH_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    pub fetch_interval: Duration,

    /// Polling timeout of the certificate fetch
    #[arg(long, env = "KUBE_CSR_FETCH_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub fetch_timeout: Duration,

    /// Do not annotate the CSR after a successful fetch
    #[arg(long, env = "KUBE_CSR_SKIP_FETCH_ANNOTATE")]
    pub skip_fetch_annotate: bool,

    /// Delete the CSR
    #[arg(short, long, env = "KUBE_CSR_DELETE")]
    pub delete: bool,

    /// Services whose addresses become SANs, as namespace/name or name, comma separated
    #[arg(long, env = "KUBE_CSR_QUERY_SVC", value_delimiter = ',')]
    pub query_svc: Vec<String>,

    /// Polling interval of the service query
    #[arg(long, env = "KUBE_CSR_QUERY_INTERVAL", default_value = "2s", value_parser = parse_duration)]
    pub query_interval: Duration,

    /// Polling timeout of the service query
    #[arg(long, env = "KUBE_CSR_QUERY_TIMEOUT", default_value = "20s", value_parser = parse_duration)]
    pub query_timeout: Duration,

    /// Keep running and renew the certificate before it expires
    #[arg(long, env = "KUBE_CSR_RENEW")]
    pub renew: bool,

    /// Renew when the certificate expires within this duration
    #[arg(long, env = "KUBE_CSR_RENEW_THRESHOLD", default_value = "1h", value_parser = parse_duration)]
    pub renew_threshold: Duration,

    /// Time between two expiration checks
    #[arg(long, env = "KUBE_CSR_RENEW_CHECK_INTERVAL", default_value = "15m", value_parser = parse_duration)]
    pub renew_check_interval: Duration,

    /// Shell command run after every renewal
    #[arg(long, env = "KUBE_CSR_RENEW_COMMAND")]
    pub renew_command: Option<String>,

    /// Exit after the first renewal
    #[arg(long, env = "KUBE_CSR_RENEW_EXIT")]
    pub renew_exit: bool,

    /// Submit every renewal under a fresh CSR name
    #[arg(long, env = "KUBE_CSR_RENEW_FRESH_NAME")]
    pub renew_fresh_name: bool,
}

/// Stages selected for an issue run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stages {
    /// Query Services for SANs
    pub query: bool,
    /// Generate the key and CSR
    pub generate: bool,
    /// Create the remote CSR
    pub submit: bool,
    /// Approve the remote CSR
    pub approve: bool,
    /// Wait for and write the certificate
    pub fetch: bool,
    /// Delete the remote CSR
    pub delete: bool,
}

impl IssueArgs {
    /// Reject a run without any stage
    pub fn validate(&self) -> Result<()> {
        if !(self.generate || self.submit || self.approve || self.fetch || self.delete || self.renew)
        {
            return Err(Error::validation(
                "must choose at least one flag: --generate, --submit, --approve, --fetch, --delete, --renew",
            ));
        }
        if self.renew && self.delete {
            return Err(Error::validation(
                "--renew needs the certificate signing request, it cannot be paired with --delete",
            ));
        }
        Ok(())
    }

    /// Stages to run; renewal needs submit and fetch
    pub fn stages(&self) -> Stages {
        Stages {
            query: !self.query_svc.is_empty(),
            generate: self.generate,
            submit: self.submit || self.renew,
            approve: self.approve,
            fetch: self.fetch || self.renew,
            delete: self.delete,
        }
    }

    /// Kubernetes CSR name
    ///
    /// `--csr-name` when given, else `<common-name>-<hostname>`.
    pub fn csr_name(&self) -> Result<String> {
        if let Some(name) = self.csr_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        let hostname = match self.hostname.as_deref().filter(|h| !h.is_empty()) {
            Some(hostname) => hostname.to_string(),
            None => hostname::get()
                .map_err(|e| Error::validation(format!("cannot get hostname: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };
        Ok(format!("{}-{}", self.common_name, hostname))
    }

    /// Build the signing request spec, resolving relative paths against `cwd`
    pub fn spec(&self, cwd: &Path) -> Result<SigningRequestSpec> {
        let mut spec = SigningRequestSpec::new(self.csr_name()?, &self.common_name, cwd);
        spec.key_bits = self.rsa_bits;
        spec.load_private_key = self.load_private_key;
        spec.override_ = self.override_;
        spec.signer_name = self.signer_name.clone();
        spec.usages = self.usages.clone();
        spec.add_subject_alternative_names(
            self.subject_alternative_names
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );

        spec.private_key.path = cwd.join(&self.private_key_file);
        spec.private_key.mode = self.private_key_perm;
        spec.csr.path = cwd.join(&self.csr_file);
        spec.csr.mode = self.csr_perm;
        spec.certificate.path = cwd.join(&self.certificate_file);
        spec.certificate.mode = self.certificate_perm;
        Ok(spec)
    }

    /// Fetch stage configuration
    pub fn fetch_config(&self) -> Result<FetchConfig> {
        Ok(FetchConfig {
            poller: Poller::new(self.fetch_interval, self.fetch_timeout)?,
            annotate: !self.skip_fetch_annotate,
            override_: self.override_,
        })
    }

    /// Query stage configuration, bare names resolved in `namespace`
    pub fn query_config(&self, namespace: &str) -> Result<QueryConfig> {
        Ok(QueryConfig {
            services: self
                .query_svc
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| ServiceRef::parse(s, namespace))
                .collect(),
            poller: Poller::new(self.query_interval, self.query_timeout)?,
        })
    }

    /// Renewal configuration when `--renew` is set
    pub fn renew_config(&self) -> Option<RenewConfig> {
        self.renew.then(|| RenewConfig {
            threshold: self.renew_threshold,
            check_interval: self.renew_check_interval,
            command: self.renew_command.clone().filter(|c| !c.trim().is_empty()),
            exit_on_renew: self.renew_exit,
            generate_fresh_name: self.renew_fresh_name,
        })
    }
}

/// Garbage collection arguments
#[derive(Args, Debug, Clone)]
pub struct GcArgs {
    /// Minimum age of a terminal state before deletion
    #[arg(long, env = "KUBE_CSR_GRACE_PERIOD", default_value = "48h", value_parser = parse_duration)]
    pub grace_period: Duration,

    /// Delete denied CSR
    #[arg(long, env = "KUBE_CSR_DENIED")]
    pub denied: bool,

    /// Delete already fetched CSR, tracked with the alpha.kube-csr/ annotations
    #[arg(long, env = "KUBE_CSR_FETCHED")]
    pub fetched: bool,

    /// Delete CSR whose certificate expired
    #[arg(long, env = "KUBE_CSR_EXPIRED")]
    pub expired: bool,

    /// Keep collecting, once per polling period
    #[arg(long, env = "KUBE_CSR_DAEMON")]
    pub daemon: bool,

    /// Time between two passes, paired with --daemon
    #[arg(long, env = "KUBE_CSR_POLLING_PERIOD", default_value = "10m", value_parser = parse_duration)]
    pub polling_period: Duration,
}

impl GcArgs {
    /// Garbage collector configuration
    pub fn gc_config(&self) -> Result<GcConfig> {
        let predicates: Vec<PredicateKind> = [
            (self.denied, PredicateKind::Denied),
            (self.fetched, PredicateKind::Fetched),
            (self.expired, PredicateKind::Expired),
        ]
        .into_iter()
        .filter_map(|(selected, kind)| selected.then_some(kind))
        .collect();

        if predicates.is_empty() {
            return Err(Error::validation(
                "must choose at least one flag: --denied, --fetched, --expired",
            ));
        }
        Ok(GcConfig {
            predicates,
            grace_period: self.grace_period,
            polling_period: self.polling_period,
        })
    }
}

/// Parse a duration such as `500ms`, `10s`, `15m`, `1h30m` or `2d`
///
/// A bare `0` is accepted. Units are `ms`, `s`, `m`, `h` and `d`.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if value == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration {value:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(60 * 60),
            "d" => Duration::from_secs(24 * 60 * 60),
            other => return Err(format!("unknown unit {other:?} in duration {value:?}")),
        };
        rest = &rest[unit_len..];

        let part = u32::try_from(amount)
            .ok()
            .and_then(|amount| unit.checked_mul(amount))
            .ok_or_else(|| format!("duration {value:?} is too large"))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration {value:?} is too large"))?;
    }
    Ok(total)
}

/// Parse unix permissions written in octal, such as `0600` or `644`
pub fn parse_mode(value: &str) -> std::result::Result<u32, String> {
    let digits = value.trim().trim_start_matches("0o");
    let mode =
        u32::from_str_radix(digits, 8).map_err(|e| format!("invalid file mode {value:?}: {e}"))?;
    if mode > 0o7777 {
        return Err(format!("invalid file mode {value:?}"));
    }
    Ok(mode)
}

fn parse_key_bits(value: &str) -> std::result::Result<u32, String> {
    let bits: u32 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid rsa bits {value:?}: {e}"))?;
    if !SUPPORTED_KEY_BITS.contains(&bits) {
        return Err(format!(
            "unsupported rsa bits {bits}, expected one of {SUPPORTED_KEY_BITS:?}"
        ));
    }
    Ok(bits)
}
