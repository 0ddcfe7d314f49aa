//! Converge waiter: poll a remote object through an injected accessor until a
//! predicate holds, the budget runs out, a terminal error shows up, or the
//! caller cancels.
//!
//! ```ignore
//! use converge_core::{predicates::condition, ResourceRef};
//! use converge_waiter::{WaitConfig, Waiter};
//!
//! let waiter = Waiter::new(WaitConfig::new(Duration::from_secs(300), Duration::from_secs(2)));
//! let cert = waiter
//!     .wait(&accessor, &ResourceRef::namespaced("e2e", "test-acme-certificate"), &condition("Ready", "True"))
//!     .await
//!     .into_result()?;
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use converge_core::{FetchError, PredicateError, ResourceRef};
use serde::Serialize;

mod config;
mod stages;
mod waiter;

pub use config::{
    NotFoundPolicy, WaitConfig, DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_MAX_POLL_INTERVAL, DEFAULT_POLL_INTERVAL,
    DEFAULT_TIMEOUT,
};
pub use stages::{Stage, StageFailure};
pub use tokio_util::sync::CancellationToken;
pub use waiter::{wait_for, Waiter};

/// Read access to the remote store. Implementations must tolerate concurrent calls.
///
/// Fetches are single attempts; retry policy belongs to the [`Waiter`].
#[async_trait::async_trait]
pub trait ObjectAccessor: Send + Sync {
    type Object: Send + Sync;

    async fn fetch(&self, target: &ResourceRef) -> Result<Self::Object, FetchError>;
}

#[async_trait::async_trait]
impl<A: ObjectAccessor + ?Sized> ObjectAccessor for Arc<A> {
    type Object = A::Object;

    async fn fetch(&self, target: &ResourceRef) -> Result<Self::Object, FetchError> {
        (**self).fetch(target).await
    }
}

/// Diagnostics attached to every outcome.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WaitReport {
    pub resource: ResourceRef,
    pub condition: String,
    pub polls: u32,
    pub elapsed: Duration,
    /// Relevant field(s) of the last fetched snapshot, as rendered by the predicate.
    pub observed: Option<String>,
}

/// Result of one wait. Exactly one variant is produced per call.
#[derive(Debug, Clone)]
pub enum WaitOutcome<O> {
    Satisfied { object: O, report: WaitReport },
    TimedOut { last_object: Option<O>, last_error: Option<FetchError>, report: WaitReport },
    Failed { error: WaitError, last_object: Option<O>, report: WaitReport },
    Cancelled { last_object: Option<O>, report: WaitReport },
}

impl<O> WaitOutcome<O> {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WaitOutcome::Satisfied { .. } => "satisfied",
            WaitOutcome::TimedOut { .. } => "timed_out",
            WaitOutcome::Failed { .. } => "failed",
            WaitOutcome::Cancelled { .. } => "cancelled",
        }
    }

    pub fn report(&self) -> &WaitReport {
        match self {
            WaitOutcome::Satisfied { report, .. }
            | WaitOutcome::TimedOut { report, .. }
            | WaitOutcome::Failed { report, .. }
            | WaitOutcome::Cancelled { report, .. } => report,
        }
    }

    /// The satisfying object, or the most recent snapshot seen before giving up.
    pub fn last_object(&self) -> Option<&O> {
        match self {
            WaitOutcome::Satisfied { object, .. } => Some(object),
            WaitOutcome::TimedOut { last_object, .. }
            | WaitOutcome::Failed { last_object, .. }
            | WaitOutcome::Cancelled { last_object, .. } => last_object.as_ref(),
        }
    }

    /// Error describing why the wait did not succeed; `None` when satisfied.
    pub fn error(&self) -> Option<WaitError> {
        match self {
            WaitOutcome::Satisfied { .. } => None,
            WaitOutcome::TimedOut { last_error, report, .. } => Some(timed_out_error(report, last_error.as_ref())),
            WaitOutcome::Failed { error, .. } => Some(error.clone()),
            WaitOutcome::Cancelled { report, .. } => Some(cancelled_error(report)),
        }
    }

    pub fn into_result(self) -> Result<O, WaitError> {
        match self {
            WaitOutcome::Satisfied { object, .. } => Ok(object),
            WaitOutcome::TimedOut { last_error, report, .. } => Err(timed_out_error(&report, last_error.as_ref())),
            WaitOutcome::Failed { error, .. } => Err(error),
            WaitOutcome::Cancelled { report, .. } => Err(cancelled_error(&report)),
        }
    }
}

fn observed_text(report: &WaitReport) -> String {
    report.observed.clone().unwrap_or_else(|| "<nothing fetched>".to_string())
}

fn timed_out_error(report: &WaitReport, last_error: Option<&FetchError>) -> WaitError {
    let mut detail = format!("last observed: {}", observed_text(report));
    if let Some(e) = last_error {
        detail.push_str("; last fetch error: ");
        detail.push_str(&e.to_string());
    }
    WaitError::TimedOut {
        resource: report.resource.to_string(),
        condition: report.condition.clone(),
        elapsed: report.elapsed,
        polls: report.polls,
        detail,
    }
}

fn cancelled_error(report: &WaitReport) -> WaitError {
    WaitError::Cancelled {
        resource: report.resource.to_string(),
        condition: report.condition.clone(),
        elapsed: report.elapsed,
        polls: report.polls,
        observed: observed_text(report),
    }
}

impl WaitError {
    pub(crate) fn not_found(report: &WaitReport, source: FetchError) -> Self {
        WaitError::NotFound {
            resource: report.resource.to_string(),
            condition: report.condition.clone(),
            elapsed: report.elapsed,
            polls: report.polls,
            observed: observed_text(report),
            source,
        }
    }

    pub(crate) fn too_many_errors(report: &WaitReport, count: u32, source: FetchError) -> Self {
        WaitError::TooManyErrors {
            resource: report.resource.to_string(),
            condition: report.condition.clone(),
            count,
            elapsed: report.elapsed,
            polls: report.polls,
            observed: observed_text(report),
            source,
        }
    }

    pub(crate) fn predicate(report: &WaitReport, source: PredicateError) -> Self {
        WaitError::Predicate {
            resource: report.resource.to_string(),
            condition: report.condition.clone(),
            elapsed: report.elapsed,
            polls: report.polls,
            observed: observed_text(report),
            source,
        }
    }
}

/// Why a wait ended without satisfying its predicate. Every variant but
/// `InvalidConfig` names the resource, the awaited condition, the time spent
/// and the last observation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("invalid wait configuration: {0}")]
    InvalidConfig(String),
    #[error("{resource} not found while waiting for {condition} after {elapsed:?} ({polls} polls): {source}; last observed: {observed}")]
    NotFound {
        resource: String,
        condition: String,
        elapsed: Duration,
        polls: u32,
        observed: String,
        source: FetchError,
    },
    #[error(
        "giving up on {resource} ({condition}) after {count} consecutive fetch errors, {elapsed:?} ({polls} polls): {source}; last observed: {observed}"
    )]
    TooManyErrors {
        resource: String,
        condition: String,
        count: u32,
        elapsed: Duration,
        polls: u32,
        observed: String,
        source: FetchError,
    },
    #[error("{resource} can never reach {condition} (after {elapsed:?}, {polls} polls): {source}; last observed: {observed}")]
    Predicate {
        resource: String,
        condition: String,
        elapsed: Duration,
        polls: u32,
        observed: String,
        source: PredicateError,
    },
    #[error("timed out after {elapsed:?} ({polls} polls) waiting for {resource} to reach {condition}; {detail}")]
    TimedOut { resource: String, condition: String, elapsed: Duration, polls: u32, detail: String },
    #[error("wait for {resource} to reach {condition} cancelled after {elapsed:?} ({polls} polls); last observed: {observed}")]
    Cancelled { resource: String, condition: String, elapsed: Duration, polls: u32, observed: String },
}
