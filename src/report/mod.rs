//! Result aggregation, QoR extraction, baseline comparison and report files.

mod baseline;
mod error;
mod qor;
mod writer;

pub use baseline::{PassRequirement, PassRequirements, Regression, RegressionChecker};
pub use error::ReportError;
pub use qor::{glob_to_regex, parse_markers, ParsePattern, QorParser};
pub use writer::{
    load_job_record, render_tsv, write_job_record, write_report, JOB_RECORD_FILE, REPORT_FILE,
    TSV_FILE,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{JobResult, JobStatus, StageStatus};

/// Version of the `batch_report.json` layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Non-empty, non-comment lines with their 1-based line numbers.
pub(crate) fn config_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Successful jobs with a failed non-fatal stage.
    pub degraded: usize,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus, degraded: bool) {
        self.total += 1;
        match status {
            JobStatus::Success => self.success += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::TimedOut => self.timed_out += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        if degraded {
            self.degraded += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub status: StageStatus,
}

/// One job's line in the batch report.
///
/// Carries nothing that varies between identical runs (no timings, no
/// absolute paths), so reports from equivalent batches compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub task: String,
    pub arch: String,
    pub circuit: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub degraded: bool,
    pub stages: Vec<StageSummary>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl From<&JobResult> for JobSummary {
    fn from(result: &JobResult) -> Self {
        Self {
            task: result.task.clone(),
            arch: file_name(&result.identity.arch),
            circuit: file_name(&result.identity.circuit),
            params: result.identity.params.clone(),
            status: result.status,
            attempts: result.attempts,
            degraded: result.degraded,
            stages: result
                .stages
                .iter()
                .map(|o| StageSummary {
                    name: o.stage.clone(),
                    status: o.status,
                })
                .collect(),
            metrics: result.metrics.clone(),
        }
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// How a batch ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every job succeeded and nothing regressed.
    Passed,
    /// Some job failed or timed out, or a baseline comparison regressed.
    Failed,
    /// The batch was cancelled before it finished.
    Cancelled,
}

/// Machine-readable summary of a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub schema_version: u32,
    pub cancelled: bool,
    pub counts: StatusCounts,
    /// Keyed by job key, so reports diff cleanly.
    pub jobs: BTreeMap<String, JobSummary>,
    /// Geometric mean of each metric over the jobs that reported a positive value.
    #[serde(default)]
    pub geomean: BTreeMap<String, f64>,
    #[serde(default)]
    pub regressions: Vec<Regression>,
}

impl BatchReport {
    /// Build a report from already-summarized jobs.
    pub fn from_jobs(jobs: BTreeMap<String, JobSummary>, cancelled: bool) -> Self {
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            counts.add(job.status, job.degraded);
        }
        let geomean = geomean(jobs.values().map(|j| &j.metrics));

        Self {
            schema_version: SCHEMA_VERSION,
            cancelled: cancelled || counts.cancelled > 0 || counts.skipped > 0,
            counts,
            jobs,
            geomean,
            regressions: Vec::new(),
        }
    }

    /// The jobs of one task, with counts and geomeans recomputed.
    /// Regressions are not carried over.
    pub fn for_task(&self, task: &str) -> BatchReport {
        let jobs = self
            .jobs
            .iter()
            .filter(|(_, j)| j.task == task)
            .map(|(k, j)| (k.clone(), j.clone()))
            .collect();
        Self::from_jobs(jobs, false)
    }

    pub fn outcome(&self) -> BatchOutcome {
        if self.cancelled {
            BatchOutcome::Cancelled
        } else if self.counts.success != self.counts.total || !self.regressions.is_empty() {
            BatchOutcome::Failed
        } else {
            BatchOutcome::Passed
        }
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = (&String, &JobSummary)> {
        self.jobs
            .iter()
            .filter(|(_, j)| matches!(j.status, JobStatus::Failed | JobStatus::TimedOut))
    }
}

/// Per-metric geometric mean over positive values.
pub fn geomean<'a>(
    metric_sets: impl IntoIterator<Item = &'a BTreeMap<String, f64>>,
) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for metrics in metric_sets {
        for (name, &value) in metrics {
            if value > 0.0 && value.is_finite() {
                let entry = sums.entry(name.as_str()).or_insert((0.0, 0));
                entry.0 += value.ln();
                entry.1 += 1;
            }
        }
    }

    sums.into_iter()
        .map(|(name, (log_sum, n))| (name.to_string(), (log_sum / n as f64).exp()))
        .collect()
}

/// Turns job results into a [`BatchReport`], optionally checking a baseline.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    baseline: Option<(BatchReport, RegressionChecker)>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_baseline(mut self, baseline: BatchReport, checker: RegressionChecker) -> Self {
        self.baseline = Some((baseline, checker));
        self
    }

    /// Summarize a batch. Pure: the same results always give the same report.
    pub fn aggregate(&self, results: &[JobResult]) -> BatchReport {
        let jobs: BTreeMap<String, JobSummary> = results
            .iter()
            .map(|r| (r.key.clone(), JobSummary::from(r)))
            .collect();

        let mut report = BatchReport::from_jobs(jobs, false);
        if let Some((baseline, checker)) = &self.baseline {
            report.regressions = checker.compare(&report.jobs, baseline);
        }
        report
    }
}
