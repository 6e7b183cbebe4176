//! Stage outcomes and job results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobIdentity, JobSpec};
use crate::pipeline::Stage;

/// How a single stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Success,
    ToolFailure,
    Timeout,
    MissingInput,
    MissingOutput,
    /// Never started because an earlier fatal stage failed or the batch
    /// was cancelled.
    Skipped,
    /// Interrupted by batch cancellation.
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ToolFailure => "tool-failure",
            Self::Timeout => "timeout",
            Self::MissingInput => "missing-input",
            Self::MissingOutput => "missing-output",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// True for statuses that describe something going wrong while the stage
    /// was attempted.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one stage for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub ordinal: u32,
    pub status: StageStatus,
    /// Whether a failure of this stage stops the job.
    pub fatal: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Outputs were already up to date, so the tool was not invoked.
    #[serde(default)]
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StageOutcome {
    pub fn new(stage: &Stage, status: StageStatus, duration: Duration) -> Self {
        Self {
            stage: stage.name().to_string(),
            ordinal: stage.ordinal(),
            status,
            fatal: stage.is_fatal(),
            duration,
            exit_code: None,
            log_path: None,
            resumed: false,
            detail: None,
        }
    }

    pub fn skipped(stage: &Stage) -> Self {
        Self::new(stage, StageStatus::Skipped, Duration::ZERO)
    }

    /// Stage satisfied by outputs left over from an earlier run.
    pub fn resumed(stage: &Stage) -> Self {
        Self {
            resumed: true,
            ..Self::new(stage, StageStatus::Success, Duration::ZERO)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_log(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// A failure that ends the job.
    pub fn is_fatal_failure(&self) -> bool {
        self.fatal && self.status.is_failure()
    }
}

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Success,
    Failed,
    TimedOut,
    Cancelled,
    /// Never dispatched.
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "timed-out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a finished (or never started) job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub key: String,
    pub task: String,
    pub identity: JobIdentity,
    pub work_dir: PathBuf,
    pub status: JobStatus,
    /// Succeeded, but at least one non-fatal stage failed.
    pub degraded: bool,
    pub attempts: u32,
    pub stages: Vec<StageOutcome>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    fn blank(spec: &JobSpec, status: JobStatus, stages: Vec<StageOutcome>) -> Self {
        Self {
            key: spec.key(),
            task: spec.task.clone(),
            identity: spec.identity.clone(),
            work_dir: spec.work_dir.clone(),
            status,
            degraded: false,
            attempts: 0,
            stages,
            metrics: BTreeMap::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Result for a job the scheduler never handed to a worker.
    pub fn not_dispatched(spec: &JobSpec, stages: &[Stage]) -> Self {
        Self::blank(
            spec,
            JobStatus::Skipped,
            stages.iter().map(StageOutcome::skipped).collect(),
        )
    }

    /// Result for a job that could not get as far as its first stage.
    pub fn setup_failed(
        spec: &JobSpec,
        stages: &[Stage],
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::blank(
            spec,
            JobStatus::Failed,
            stages.iter().map(StageOutcome::skipped).collect(),
        );
        result.attempts = attempts;
        result.error = Some(error.into());
        result.finished_at = Some(Utc::now());
        result
    }

    /// Job status and degraded flag implied by a sequence of stage outcomes.
    ///
    /// The first fatal failure decides the status. Without one the job
    /// succeeded, degraded if any non-fatal stage failed.
    pub fn derive_status(stages: &[StageOutcome]) -> (JobStatus, bool) {
        if let Some(first) = stages.iter().find(|o| o.is_fatal_failure()) {
            let status = match first.status {
                StageStatus::Timeout => JobStatus::TimedOut,
                StageStatus::Cancelled => JobStatus::Cancelled,
                _ => JobStatus::Failed,
            };
            return (status, false);
        }

        if !stages.is_empty() && stages.iter().all(|o| o.status == StageStatus::Skipped) {
            return (JobStatus::Skipped, false);
        }

        let degraded = stages.iter().any(|o| o.status.is_failure());
        (JobStatus::Success, degraded)
    }

    /// The stage whose failure decided this job's status.
    pub fn first_fatal_failure(&self) -> Option<&StageOutcome> {
        self.stages.iter().find(|o| o.is_fatal_failure())
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CommandTemplate, Stage};

    fn stage(name: &str, ordinal: u32, fatal: bool) -> Stage {
        let stage = Stage::new(name, ordinal, CommandTemplate::new("true"));
        if fatal {
            stage
        } else {
            stage.non_fatal()
        }
    }

    fn outcome(name: &str, fatal: bool, status: StageStatus) -> StageOutcome {
        StageOutcome::new(&stage(name, 1, fatal), status, Duration::ZERO)
    }

    #[test]
    fn test_all_success() {
        let stages = vec![
            outcome("synth", true, StageStatus::Success),
            outcome("route", true, StageStatus::Success),
        ];
        assert_eq!(JobResult::derive_status(&stages), (JobStatus::Success, false));
    }

    #[test]
    fn test_first_fatal_failure_wins() {
        let stages = vec![
            outcome("synth", true, StageStatus::Timeout),
            outcome("route", true, StageStatus::ToolFailure),
        ];
        assert_eq!(JobResult::derive_status(&stages), (JobStatus::TimedOut, false));

        let stages = vec![
            outcome("synth", true, StageStatus::MissingInput),
            outcome("route", true, StageStatus::Skipped),
        ];
        assert_eq!(JobResult::derive_status(&stages), (JobStatus::Failed, false));
    }

    #[test]
    fn test_non_fatal_failure_degrades() {
        let stages = vec![
            outcome("route", true, StageStatus::Success),
            outcome("sta", false, StageStatus::ToolFailure),
        ];
        assert_eq!(JobResult::derive_status(&stages), (JobStatus::Success, true));
    }

    #[test]
    fn test_all_skipped_is_skipped() {
        let stages = vec![outcome("synth", true, StageStatus::Skipped)];
        assert_eq!(JobResult::derive_status(&stages), (JobStatus::Skipped, false));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(JobStatus::TimedOut.as_str(), "timed-out");
        assert_eq!(JobStatus::from_str("timed-out"), Some(JobStatus::TimedOut));
        assert_eq!(
            serde_json::to_string(&StageStatus::MissingOutput).unwrap(),
            "\"missing-output\""
        );
    }

    #[test]
    fn test_outcome_duration_serializes_as_millis() {
        let mut o = outcome("synth", true, StageStatus::Success);
        o.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["duration"], 1500);
        let back: StageOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, o);
    }
}
