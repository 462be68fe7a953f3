//! Garbage collection of stale signing requests
//!
//! A pass lists every signing request once and deletes those matching any
//! configured predicate. The loop runs a pass per polling period until
//! cancelled; a failed pass is counted and the loop carries on.

pub mod predicates;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::humanize;
use crate::metrics::{GcTimer, GC_DELETES, GC_DELETE_ERRORS, GC_LOOP_ERRORS};
use crate::store::SigningRequestStore;
use crate::{Error, Result};

pub use predicates::{is_denied, is_expired, is_fetched, GcPredicate, PredicateKind};

/// Garbage collector configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Predicates OR-combined to decide eligibility
    pub predicates: Vec<PredicateKind>,
    /// Minimum age of the terminal state before collection
    pub grace_period: Duration,
    /// Time between two passes of the loop
    pub polling_period: Duration,
}

/// Outcome of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Signing requests listed
    pub listed: usize,
    /// Signing requests deleted
    pub deleted: usize,
}

impl GcReport {
    /// Signing requests left behind
    pub fn remaining(&self) -> usize {
        self.listed - self.deleted
    }
}

/// Deletes signing requests matching the configured predicates
pub struct GarbageCollector {
    store: Arc<dyn SigningRequestStore>,
    config: GcConfig,
}

impl GarbageCollector {
    /// Create a collector, rejecting a zero polling period or an empty predicate set
    pub fn new(store: Arc<dyn SigningRequestStore>, config: GcConfig) -> Result<Self> {
        if config.polling_period.is_zero() {
            return Err(Error::validation("gc polling period must be greater than zero"));
        }
        if config.predicates.is_empty() {
            return Err(Error::validation(
                "at least one of denied, fetched or expired must be selected",
            ));
        }
        Ok(Self { store, config })
    }

    /// Run one pass
    ///
    /// Each eligible request is deleted at most once. A failed deletion aborts
    /// the pass.
    #[instrument(skip(self))]
    pub async fn garbage_collect(&self) -> Result<GcReport> {
        let timer = GcTimer::start();
        let started = Instant::now();
        let now = Utc::now();

        let requests = self.store.list().await?;
        debug!(count = requests.len(), "listed csr");

        let mut report = GcReport {
            listed: requests.len(),
            deleted: 0,
        };
        for csr in &requests {
            let Some(kind) = self
                .config
                .predicates
                .iter()
                .find(|kind| (kind.predicate())(csr, self.config.grace_period, now))
            else {
                continue;
            };

            if let Err(e) = self.store.delete(&csr.name).await {
                GC_DELETE_ERRORS.add(1, &[]);
                error!(csr = %csr.name, uid = %csr.uid(), error = %e, "cannot delete csr");
                return Err(e);
            }
            GC_DELETES.add(1, &[]);
            report.deleted += 1;
            info!(csr = %csr.name, uid = %csr.uid(), reason = kind.as_str(), "csr deleted");
        }

        timer.complete(report.remaining());
        let elapsed = humanize(started.elapsed());
        if report.deleted > 0 {
            info!(deleted = report.deleted, %elapsed, "garbage collected csr");
        } else {
            info!(%elapsed, "ended without garbage collect");
        }
        Ok(report)
    }

    /// Run a pass per polling period until `cancel` fires
    ///
    /// The first pass runs after one period. A failed pass is counted and
    /// logged; the loop only returns on cancellation.
    pub async fn garbage_collect_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let period = self.config.polling_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(first_run_in = %humanize(period), "starting gc loop");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("gc loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.garbage_collect().await {
                        GC_LOOP_ERRORS.add(1, &[]);
                        error!(error = %e, "garbage collection failed");
                    }
                }
            }
        }
    }
}
