//! Which failed jobs get another attempt.

use std::collections::BTreeSet;

use crate::models::{JobResult, JobStatus, StageStatus};

/// Retries jobs whose deciding failure is a timeout or tool failure in a
/// stage marked flaky.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    flaky_stages: BTreeSet<String>,
}

impl RetryPolicy {
    pub fn new<I, S>(retries: u32, flaky_stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            retries,
            flaky_stages: flaky_stages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub fn is_flaky(&self, stage: &str) -> bool {
        self.flaky_stages.contains(stage)
    }

    /// Whether `result`, produced by attempt number `attempt`, warrants
    /// another attempt. Returns the reason when it does.
    pub fn should_retry(&self, result: &JobResult, attempt: u32) -> Option<String> {
        if attempt >= self.max_attempts() {
            return None;
        }
        if !matches!(result.status, JobStatus::Failed | JobStatus::TimedOut) {
            return None;
        }

        let failure = result.first_fatal_failure()?;
        let retryable = matches!(failure.status, StageStatus::Timeout | StageStatus::ToolFailure);
        if retryable && self.is_flaky(&failure.stage) {
            Some(format!("{} {}", failure.stage, failure.status))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobIdentity, JobSpec, StageOutcome};
    use crate::pipeline::{CommandTemplate, Stage};
    use std::time::Duration;

    fn failed_at(stage: &str, status: StageStatus) -> JobResult {
        let spec = JobSpec::new("t", JobIdentity::new("c.v", "a.xml"));
        let stages = [Stage::new(stage, 1, CommandTemplate::new("true"))];
        let mut result = JobResult::setup_failed(&spec, &stages, 1, "x");
        result.error = None;
        result.stages = vec![StageOutcome::new(&stages[0], status, Duration::ZERO)];
        result.status = JobResult::derive_status(&result.stages).0;
        result
    }

    #[test]
    fn test_retries_flaky_timeouts() {
        let policy = RetryPolicy::new(2, ["route"]);
        assert_eq!(policy.max_attempts(), 3);

        let result = failed_at("route", StageStatus::Timeout);
        assert!(policy.should_retry(&result, 1).is_some());
        assert!(policy.should_retry(&result, 2).is_some());
        assert!(policy.should_retry(&result, 3).is_none());
    }

    #[test]
    fn test_ignores_other_failures() {
        let policy = RetryPolicy::new(2, ["route"]);
        assert!(policy
            .should_retry(&failed_at("place", StageStatus::Timeout), 1)
            .is_none());
        assert!(policy
            .should_retry(&failed_at("route", StageStatus::MissingInput), 1)
            .is_none());
        assert!(RetryPolicy::none()
            .should_retry(&failed_at("route", StageStatus::ToolFailure), 1)
            .is_none());
    }
}
