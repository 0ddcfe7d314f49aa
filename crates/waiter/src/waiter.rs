use std::time::Duration;

use converge_core::{FetchError, Predicate, ResourceRef};
use metrics::{counter, histogram};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{NotFoundPolicy, ObjectAccessor, WaitConfig, WaitError, WaitOutcome, WaitReport};

/// Polls one object per call. Holds only its policy, so a single `Waiter`
/// can serve any number of concurrent waits.
#[derive(Debug, Clone, Default)]
pub struct Waiter {
    config: WaitConfig,
}

/// Ephemeral record of one poll, used for logging only.
#[derive(Debug)]
struct PollAttempt {
    attempt: u32,
    at: chrono::DateTime<chrono::Utc>,
    fetch: &'static str,
    satisfied: Option<bool>,
}

impl PollAttempt {
    fn log(&self, target: &ResourceRef) {
        debug!(
            resource = %target,
            attempt = self.attempt,
            at = %self.at.to_rfc3339(),
            fetch = self.fetch,
            satisfied = ?self.satisfied,
            "poll attempt"
        );
    }
}

/// Wait with an explicit budget and tick rate and otherwise default policy.
pub async fn wait_for<A, P>(
    accessor: &A,
    target: &ResourceRef,
    predicate: &P,
    timeout: Duration,
    poll_interval: Duration,
) -> WaitOutcome<A::Object>
where
    A: ObjectAccessor + ?Sized,
    P: Predicate<A::Object> + ?Sized,
{
    Waiter::new(WaitConfig::new(timeout, poll_interval)).wait(accessor, target, predicate).await
}

impl Waiter {
    pub fn new(config: WaitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Same policy with a different overall budget.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self { config: self.config.clone().with_timeout(timeout) }
    }

    pub async fn wait<A, P>(&self, accessor: &A, target: &ResourceRef, predicate: &P) -> WaitOutcome<A::Object>
    where
        A: ObjectAccessor + ?Sized,
        P: Predicate<A::Object> + ?Sized,
    {
        self.wait_with_cancel(accessor, target, predicate, &CancellationToken::new()).await
    }

    /// Poll `target` until `predicate` holds.
    ///
    /// The first fetch happens immediately. Ticks are spaced `poll_interval`
    /// apart from the start of each fetch; the last tick is clamped to the
    /// deadline so the final snapshot is taken when the budget runs out. A
    /// fetch that straddles the deadline still gets its predicate evaluated,
    /// and a satisfied result wins over the timeout.
    pub async fn wait_with_cancel<A, P>(
        &self,
        accessor: &A,
        target: &ResourceRef,
        predicate: &P,
        cancel: &CancellationToken,
    ) -> WaitOutcome<A::Object>
    where
        A: ObjectAccessor + ?Sized,
        P: Predicate<A::Object> + ?Sized,
    {
        let cfg = &self.config;
        let condition = predicate.describe();
        let started = Instant::now();
        let mut polls = 0u32;
        let mut last_object: Option<A::Object> = None;
        let mut last_error: Option<FetchError> = None;
        let mut consecutive_errors = 0u32;

        let report = |polls: u32, observed: Option<String>| WaitReport {
            resource: target.clone(),
            condition: condition.clone(),
            polls,
            elapsed: started.elapsed(),
            observed,
        };

        if let Err(error) = cfg.validate() {
            return conclude(WaitOutcome::Failed { error, last_object: None, report: report(0, None) });
        }

        let deadline = started + cfg.timeout;
        info!(
            resource = %target,
            condition = %condition,
            timeout_ms = cfg.timeout.as_millis() as u64,
            interval_ms = cfg.poll_interval.as_millis() as u64,
            "waiting for condition"
        );

        loop {
            if cancel.is_cancelled() {
                let observed = last_object.as_ref().and_then(|o| predicate.observe(o));
                return conclude(WaitOutcome::Cancelled { last_object, report: report(polls, observed) });
            }

            let tick = Instant::now();
            polls += 1;
            counter!("converge_wait_polls_total", 1);
            let mut attempt = PollAttempt { attempt: polls, at: chrono::Utc::now(), fetch: "ok", satisfied: None };

            // A fetch still running one interval past the deadline is abandoned;
            // one that lands before then is still evaluated.
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let observed = last_object.as_ref().and_then(|o| predicate.observe(o));
                    return conclude(WaitOutcome::Cancelled { last_object, report: report(polls, observed) });
                }
                res = accessor.fetch(target) => res,
                _ = sleep_until(deadline + cfg.poll_interval) => {
                    warn!(resource = %target, attempt = polls, "fetch outlived the wait budget, abandoning it");
                    let observed = last_object.as_ref().and_then(|o| predicate.observe(o));
                    return conclude(WaitOutcome::TimedOut { last_object, last_error, report: report(polls, observed) });
                }
            };

            let mut delay = cfg.poll_interval;
            match fetched {
                Ok(obj) => {
                    consecutive_errors = 0;
                    last_error = None;
                    let verdict = predicate.evaluate(&obj);
                    attempt.satisfied = Some(matches!(verdict, Ok(true)));
                    attempt.log(target);
                    match verdict {
                        Ok(true) => {
                            let observed = predicate.observe(&obj);
                            return conclude(WaitOutcome::Satisfied { object: obj, report: report(polls, observed) });
                        }
                        Err(source) => {
                            let report = report(polls, predicate.observe(&obj));
                            let error = WaitError::predicate(&report, source);
                            return conclude(WaitOutcome::Failed { error, last_object: Some(obj), report });
                        }
                        Ok(false) => last_object = Some(obj),
                    }
                }
                Err(e) if e.is_not_found() => {
                    consecutive_errors = 0;
                    attempt.fetch = "not_found";
                    attempt.log(target);
                    if cfg.not_found == NotFoundPolicy::Fail {
                        let report = report(polls, last_object.as_ref().and_then(|o| predicate.observe(o)));
                        let error = WaitError::not_found(&report, e);
                        return conclude(WaitOutcome::Failed { error, last_object, report });
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    attempt.fetch = "error";
                    attempt.log(target);
                    counter!("converge_wait_fetch_errors_total", 1);
                    if let Some(max) = cfg.max_consecutive_errors {
                        if consecutive_errors > max {
                            let report = report(polls, last_object.as_ref().and_then(|o| predicate.observe(o)));
                            let error = WaitError::too_many_errors(&report, consecutive_errors, e);
                            return conclude(WaitOutcome::Failed { error, last_object, report });
                        }
                    }
                    delay = cfg.delay_after_errors(consecutive_errors);
                    warn!(
                        resource = %target,
                        error = %e,
                        consecutive = consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying"
                    );
                    last_error = Some(e);
                }
            }

            if Instant::now() >= deadline {
                let observed = last_object.as_ref().and_then(|o| predicate.observe(o));
                return conclude(WaitOutcome::TimedOut { last_object, last_error, report: report(polls, observed) });
            }

            let next = (tick + delay).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let observed = last_object.as_ref().and_then(|o| predicate.observe(o));
                    return conclude(WaitOutcome::Cancelled { last_object, report: report(polls, observed) });
                }
                _ = sleep_until(next) => {}
            }
        }
    }
}

fn conclude<O>(outcome: WaitOutcome<O>) -> WaitOutcome<O> {
    let kind = outcome.kind();
    let r = outcome.report();
    let elapsed_ms = r.elapsed.as_secs_f64() * 1000.0;
    histogram!("converge_wait_ms", elapsed_ms, "outcome" => kind);
    match &outcome {
        WaitOutcome::Satisfied { .. } => {
            info!(resource = %r.resource, condition = %r.condition, polls = r.polls, elapsed_ms = elapsed_ms as u64, "condition satisfied");
        }
        _ => {
            let error = outcome.error().map(|e| e.to_string()).unwrap_or_default();
            warn!(
                resource = %r.resource,
                condition = %r.condition,
                outcome = kind,
                polls = r.polls,
                elapsed_ms = elapsed_ms as u64,
                observed = ?r.observed,
                error = %error,
                "wait ended without convergence"
            );
        }
    }
    outcome
}
