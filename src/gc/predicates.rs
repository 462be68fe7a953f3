//! Garbage collection eligibility predicates
//!
//! Each predicate is a pure function of the signing request, the grace period
//! and the current time. A request is collected when any configured predicate
//! holds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::pki::CertificateInfo;
use crate::store::{ConditionType, SigningRequest, FETCH_COUNT_ANNOTATION};

/// Signature shared by every predicate
pub type GcPredicate = fn(&SigningRequest, Duration, DateTime<Utc>) -> bool;

/// Named predicate selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    /// [`is_denied`]
    Denied,
    /// [`is_fetched`]
    Fetched,
    /// [`is_expired`]
    Expired,
}

impl PredicateKind {
    /// The predicate function
    pub fn predicate(&self) -> GcPredicate {
        match self {
            Self::Denied => is_denied,
            Self::Fetched => is_fetched,
            Self::Expired => is_expired,
        }
    }

    /// Label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Denied => "denied",
            Self::Fetched => "fetched",
            Self::Expired => "expired",
        }
    }
}

fn grace_limit(grace: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// First condition is Denied and was last updated at least `grace` ago
pub fn is_denied(csr: &SigningRequest, grace: Duration, now: DateTime<Utc>) -> bool {
    let Some(first) = csr.conditions.first() else {
        trace!(csr = %csr.name, uid = %csr.uid(), "no condition");
        return false;
    };
    if csr.conditions.len() > 1 {
        warn!(
            csr = %csr.name,
            uid = %csr.uid(),
            conditions = csr.conditions.len(),
            "unexpected number of conditions"
        );
    }
    if first.type_ != ConditionType::Denied {
        return false;
    }
    let Some(updated) = first.last_update_time else {
        debug!(csr = %csr.name, uid = %csr.uid(), "denied condition without update time");
        return false;
    };
    updated <= grace_limit(grace, now)
}

/// Fetched at least once, the latest fetch at least `grace` ago
pub fn is_fetched(csr: &SigningRequest, grace: Duration, now: DateTime<Utc>) -> bool {
    match csr.fetch_count() {
        None => {
            trace!(
                csr = %csr.name,
                value = ?csr.annotations.get(FETCH_COUNT_ANNOTATION),
                "invalid fetch count annotation"
            );
            return false;
        }
        Some(0) => return false,
        Some(_) => {}
    }
    let Some(last_fetch) = csr.last_fetch_time() else {
        debug!(csr = %csr.name, uid = %csr.uid(), "fetched without a valid fetch time");
        return false;
    };
    last_fetch <= grace_limit(grace, now)
}

/// The embedded certificate expired more than `grace` ago
pub fn is_expired(csr: &SigningRequest, grace: Duration, now: DateTime<Utc>) -> bool {
    let Some(certificate) = csr.certificate() else {
        return false;
    };
    match CertificateInfo::from_pem(certificate) {
        Ok(info) => info.not_after < grace_limit(grace, now),
        Err(e) => {
            warn!(csr = %csr.name, uid = %csr.uid(), error = %e, "cannot parse certificate");
            false
        }
    }
}
