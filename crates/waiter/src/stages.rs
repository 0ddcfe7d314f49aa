//! Sequential waits with their own budgets, so a failure is pinned to the
//! stage that did not converge.

use std::fmt;
use std::time::Duration;

use converge_core::{Predicate, ResourceRef};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{ObjectAccessor, WaitError, WaitOutcome, WaitReport, Waiter};

pub struct Stage<O> {
    pub label: String,
    pub predicate: Box<dyn Predicate<O>>,
    pub timeout: Duration,
}

impl<O> Stage<O> {
    pub fn new(label: impl Into<String>, predicate: impl Predicate<O> + 'static, timeout: Duration) -> Self {
        Self { label: label.into(), predicate: Box::new(predicate), timeout }
    }
}

/// The first stage that did not converge, with its outcome.
#[derive(Debug)]
pub struct StageFailure<O> {
    pub index: usize,
    pub label: String,
    pub outcome: WaitOutcome<O>,
}

impl<O> fmt::Display for StageFailure<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome.error() {
            Some(e) => write!(f, "stage {} ({}) failed: {}", self.index + 1, self.label, e),
            None => write!(f, "stage {} ({}) failed", self.index + 1, self.label),
        }
    }
}

impl<O: fmt::Debug> std::error::Error for StageFailure<O> {}

impl Waiter {
    /// Run `stages` in order against the same object, each with its own timeout.
    /// Returns the snapshot that satisfied the last stage.
    pub async fn wait_stages<A>(
        &self,
        accessor: &A,
        target: &ResourceRef,
        stages: &[Stage<A::Object>],
        cancel: &CancellationToken,
    ) -> Result<A::Object, StageFailure<A::Object>>
    where
        A: ObjectAccessor + ?Sized,
    {
        let Some((last_stage, earlier)) = stages.split_last() else {
            let report = WaitReport {
                resource: target.clone(),
                condition: String::new(),
                polls: 0,
                elapsed: Duration::ZERO,
                observed: None,
            };
            return Err(StageFailure {
                index: 0,
                label: String::new(),
                outcome: WaitOutcome::Failed {
                    error: WaitError::InvalidConfig("no stages to wait for".into()),
                    last_object: None,
                    report,
                },
            });
        };

        for (index, stage) in earlier.iter().enumerate() {
            self.run_stage(accessor, target, index, stage, cancel).await?;
        }
        self.run_stage(accessor, target, earlier.len(), last_stage, cancel).await
    }

    async fn run_stage<A>(
        &self,
        accessor: &A,
        target: &ResourceRef,
        index: usize,
        stage: &Stage<A::Object>,
        cancel: &CancellationToken,
    ) -> Result<A::Object, StageFailure<A::Object>>
    where
        A: ObjectAccessor + ?Sized,
    {
        info!(resource = %target, stage = %stage.label, index, "starting wait stage");
        match self
            .with_timeout(stage.timeout)
            .wait_with_cancel(accessor, target, stage.predicate.as_ref(), cancel)
            .await
        {
            WaitOutcome::Satisfied { object, .. } => Ok(object),
            outcome => Err(StageFailure { index, label: stage.label.clone(), outcome }),
        }
    }
}
