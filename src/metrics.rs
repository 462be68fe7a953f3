//! Metrics registry for kube-csr observability
//!
//! Provides OpenTelemetry metrics for:
//! - Certificate issuance (pipeline runs)
//! - Garbage collection (duration, remaining, deletions)
//! - Renewal (expiry horizon, renewal counts)

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for kube-csr metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("kube-csr"));

// ============================================================================
// Issuance Metrics
// ============================================================================

/// Counter of completed pipeline runs
///
/// Labels:
/// - `result`: success, error
pub static ISSUED_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kube_csr_issued_total")
        .with_description("Total number of pipeline runs")
        .with_unit("{runs}")
        .build()
});

// ============================================================================
// Garbage Collection Metrics
// ============================================================================

/// Histogram of garbage collection pass duration
pub static GC_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kube_csr_gc_duration_seconds")
        .with_description("Duration of garbage collection passes in seconds")
        .with_unit("s")
        .build()
});

/// Gauge of signing requests left after the latest pass
pub static GC_REMAINING: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("kube_csr_gc_remaining")
        .with_description("Signing requests remaining after the latest garbage collection")
        .with_unit("{csr}")
        .build()
});

/// Counter of signing requests deleted by garbage collection
pub static GC_DELETES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kube_csr_gc_deletes_total")
        .with_description("Total number of garbage collected signing requests")
        .with_unit("{csr}")
        .build()
});

/// Counter of failed garbage collection deletions
pub static GC_DELETE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kube_csr_gc_delete_errors_total")
        .with_description("Total number of failed garbage collection deletions")
        .with_unit("{errors}")
        .build()
});

/// Counter of failed passes inside the garbage collection loop
pub static GC_LOOP_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kube_csr_gc_loop_errors_total")
        .with_description("Total number of failed garbage collection passes")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Renewal Metrics
// ============================================================================

/// Counter of renewals
pub static RENEW_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kube_csr_renew_total")
        .with_description("Total number of certificate renewals")
        .with_unit("{renewals}")
        .build()
});

/// Counter of failed renewals
pub static RENEW_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kube_csr_renew_errors_total")
        .with_description("Total number of failed certificate renewals")
        .with_unit("{errors}")
        .build()
});

/// Gauge of seconds left before the local certificate expires
pub static SECONDS_BEFORE_EXPIRATION: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("kube_csr_certificate_seconds_before_expiration")
        .with_description("Seconds before the local certificate expires")
        .with_unit("s")
        .build()
});

/// Gauge of seconds left before the local certificate is renewed
pub static SECONDS_BEFORE_RENEW: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("kube_csr_certificate_seconds_before_renew")
        .with_description("Seconds before the local certificate is renewed")
        .with_unit("s")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Outcome label for pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// Every configured stage completed
    Success,
    /// A stage failed
    Error,
}

impl RunResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Record a pipeline run outcome
pub fn record_issued(result: RunResult) {
    ISSUED_TOTAL.add(1, &[KeyValue::new("result", result.as_str())]);
}

/// Times one garbage collection pass
pub struct GcTimer {
    start: Instant,
}

impl GcTimer {
    /// Start timing a pass
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the pass duration and the number of requests left behind
    pub fn complete(self, remaining: usize) {
        GC_DURATION.record(self.start.elapsed().as_secs_f64(), &[]);
        GC_REMAINING.record(i64::try_from(remaining).unwrap_or(i64::MAX), &[]);
    }
}
