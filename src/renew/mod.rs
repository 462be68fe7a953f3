//! Certificate renewal scheduler
//!
//! Wraps an issuing [`Pipeline`] and re-runs it whenever the local
//! certificate gets within the renewal threshold of its expiry. Each renewal
//! can use a fresh signing request name, so a still-live previous request
//! never collides with the new one.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::humanize;
use crate::metrics::{RENEW_ERRORS, RENEW_TOTAL, SECONDS_BEFORE_EXPIRATION, SECONDS_BEFORE_RENEW};
use crate::pipeline::Pipeline;
use crate::pki::{self, CertificateInfo};
use crate::{Error, Result};

/// Renewal timing and post-renewal behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewConfig {
    /// Renew once the certificate expires within this duration
    pub threshold: Duration,
    /// Time between two expiry checks
    pub check_interval: Duration,
    /// Shell command run after every renewal
    pub command: Option<String>,
    /// Return after the first renewal
    pub exit_on_renew: bool,
    /// Derive a new signing request name for every renewal
    pub generate_fresh_name: bool,
}

/// Result of an expiry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalCheck {
    /// Time until `notAfter`, negative once expired
    pub time_left: chrono::Duration,
    /// Time until the renewal threshold is reached, negative once passed
    pub time_before_renew: chrono::Duration,
}

impl RenewalCheck {
    /// Evaluate `info` against `threshold` at `now`
    pub fn evaluate(
        info: &CertificateInfo,
        threshold: Duration,
        now: chrono::DateTime<Utc>,
    ) -> Self {
        let time_left = info.time_left(now);
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        Self {
            time_left,
            time_before_renew: time_left - threshold,
        }
    }

    /// Whether the certificate must be renewed now
    pub fn is_due(&self) -> bool {
        self.time_before_renew <= chrono::Duration::zero()
    }
}

/// Derive a renewal name from the original signing request name
pub fn fresh_name(base_name: &str) -> String {
    let id = Uuid::new_v4().to_string();
    format!("{base_name}-{}", &id[..13])
}

/// Re-runs a pipeline before the certificate it produced expires
pub struct RenewalScheduler {
    pipeline: Pipeline,
    config: RenewConfig,
    base_name: String,
}

impl RenewalScheduler {
    /// Wrap `pipeline`
    ///
    /// The pipeline must submit and fetch, and the private key, CSR and
    /// certificate files must already exist. Override is forced on the spec
    /// and on the fetch stage.
    pub fn new(mut pipeline: Pipeline, config: RenewConfig) -> Result<Self> {
        if config.check_interval.is_zero() {
            return Err(Error::validation(
                "renew check interval must be greater than zero",
            ));
        }
        if !pipeline.has_submit() {
            return Err(Error::validation("renew requires the submit stage"));
        }
        let Some(fetch) = pipeline.fetch_mut() else {
            return Err(Error::validation("renew requires the fetch stage"));
        };
        fetch.config_mut().override_ = true;

        let spec = pipeline.spec_mut();
        spec.override_ = true;
        check_paths(&[
            spec.private_key.path.as_path(),
            spec.csr.path.as_path(),
            spec.certificate.path.as_path(),
        ])?;

        let base_name = spec.name.clone();
        Ok(Self {
            pipeline,
            config,
            base_name,
        })
    }

    /// The wrapped pipeline
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Check the local certificate and record the expiry gauges
    pub async fn should_renew(&self) -> Result<bool> {
        let path = &self.pipeline.spec().certificate.path;
        let pem = pki::read_file(path).await?;
        let info = CertificateInfo::from_pem(&pem)?;
        let check = RenewalCheck::evaluate(&info, self.config.threshold, Utc::now());

        SECONDS_BEFORE_EXPIRATION.record(check.time_left.num_seconds() as f64, &[]);
        SECONDS_BEFORE_RENEW.record(check.time_before_renew.num_seconds() as f64, &[]);

        info!(
            path = %path.display(),
            not_after = %info.not_after,
            time_left_secs = check.time_left.num_seconds(),
            time_before_renew_secs = check.time_before_renew.num_seconds(),
            "certificate checked"
        );
        if !check.is_due() {
            debug!(path = %path.display(), "certificate doesn't need a renew yet");
        }
        Ok(check.is_due())
    }

    /// Renew when due, returning whether a renewal happened
    pub async fn process_renew(&mut self, cancel: &CancellationToken) -> Result<bool> {
        if !self.should_renew().await? {
            return Ok(false);
        }
        if self.config.generate_fresh_name {
            self.pipeline.spec_mut().name = fresh_name(&self.base_name);
        }
        info!(
            cn = %self.pipeline.spec().common_name,
            csr = %self.pipeline.spec().name,
            "renewing certificate"
        );
        self.pipeline.run(cancel).await?;
        RENEW_TOTAL.add(1, &[]);
        info!(csr = %self.pipeline.spec().name, "successfully renewed");
        Ok(true)
    }

    /// Check now, then every check interval until cancelled
    ///
    /// The first check fails fast. Later failures are counted and the loop
    /// continues. Returns after a renewal when `exit_on_renew` is set.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.process_renew(cancel).await {
            Ok(true) => {
                if self.after_renew().await? {
                    return Ok(());
                }
            }
            Ok(false) => {}
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }

        let interval = self.config.check_interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            path = %self.pipeline.spec().certificate.path.display(),
            every = %humanize(interval),
            "starting the renew process"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("renew process cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.process_renew(cancel).await {
                        Ok(true) => {
                            if self.after_renew().await? {
                                return Ok(());
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            RENEW_ERRORS.add(1, &[]);
                            error!(error = %e, "renew failed");
                        }
                    }
                }
            }
        }
    }

    /// Run the hook and tell whether to stop
    async fn after_renew(&self) -> Result<bool> {
        if let Some(command) = &self.config.command {
            run_hook(command).await?;
        }
        if self.config.exit_on_renew {
            info!("exit on successful renew");
            return Ok(true);
        }
        Ok(false)
    }
}

fn check_paths(paths: &[&Path]) -> Result<()> {
    let missing: Vec<String> = paths
        .iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::validation(format!(
        "missing files required to renew: {}",
        missing.join(", ")
    )))
}

/// Run `command` with `/bin/sh -c`, logging its combined output
pub async fn run_hook(command: &str) -> Result<()> {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| Error::Hook {
            command: command.to_string(),
            message: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    info!(command, %stdout, %stderr, "renew command output");

    if !output.status.success() {
        warn!(command, status = %output.status, "renew command failed");
        return Err(Error::Hook {
            command: command.to_string(),
            message: output.status.to_string(),
        });
    }
    Ok(())
}
