//! Running one job's stages in order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{JobResult, JobSpec, JobStatus, StageOutcome, StageStatus};
use crate::pipeline::{PipelineDefinition, PipelineError, Stage, TemplateVars};
use crate::report::{load_job_record, write_job_record, JOB_RECORD_FILE};
use crate::runner::{outputs_up_to_date, stage_log_path, StageContext, StageExecutor};
use crate::scheduler::BatchEvent;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {key} has already been executed")]
    AlreadyExecuted { key: String },

    #[error("job {key}: {source}")]
    Pipeline {
        key: String,
        #[source]
        source: PipelineError,
    },

    #[error("job {key}: cannot prepare working directory {path}: {source}")]
    WorkDir {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle of a [`Job`]. A job runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed(JobStatus),
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Skip stages whose outputs are already newer than their inputs.
    pub resume: bool,
    /// Empty the working directory before the first stage.
    pub clean: bool,
    /// Wall-clock budget for all stages together.
    pub job_timeout: Option<Duration>,
}

/// One (circuit, arch, params) combination pushed through a stage range.
pub struct Job {
    spec: JobSpec,
    pipeline: Arc<PipelineDefinition>,
    executor: Arc<dyn StageExecutor>,
    options: JobOptions,
    attempt: u32,
    state: JobState,
    events: Option<mpsc::Sender<BatchEvent>>,
}

impl Job {
    pub fn new(
        spec: JobSpec,
        pipeline: Arc<PipelineDefinition>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            spec,
            pipeline,
            executor,
            options: JobOptions::default(),
            attempt: 1,
            state: JobState::Pending,
            events: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Attempt number recorded in the result (1-based).
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    async fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    fn prepare_work_dir(&self) -> Result<(), JobError> {
        let dir = &self.spec.work_dir;
        let err = |source| JobError::WorkDir {
            key: self.spec.key(),
            path: dir.clone(),
            source,
        };
        if self.options.clean && dir.exists() {
            std::fs::remove_dir_all(dir).map_err(err)?;
        }
        std::fs::create_dir_all(dir).map_err(err)
    }

    /// A stage with declared outputs is fresh when they are up to date. A
    /// stage without outputs is fresh only when the previous record shows it
    /// succeeded and its log is not older than its inputs.
    fn is_fresh(&self, stage: &Stage, vars: &TemplateVars, prior: Option<&JobResult>) -> bool {
        let work_dir = &self.spec.work_dir;
        let (inputs, outputs) = match (
            stage.resolve_inputs(vars, work_dir),
            stage.resolve_outputs(vars, work_dir),
        ) {
            (Ok(inputs), Ok(outputs)) => (inputs, outputs),
            _ => return false,
        };
        if !outputs.is_empty() {
            return outputs_up_to_date(&inputs, &outputs);
        }

        let succeeded = prior.is_some_and(|record| {
            record
                .stages
                .iter()
                .any(|o| o.stage == stage.name() && o.status == StageStatus::Success)
        });
        succeeded && outputs_up_to_date(&inputs, &[stage_log_path(work_dir, stage.name())])
    }

    /// Run every stage in the job's range, stopping at the first fatal
    /// failure. Stages that never ran are recorded as skipped.
    ///
    /// Errors are limited to problems that prevent the first stage from
    /// starting; stage failures are reported in the result.
    pub async fn execute(&mut self, cancel: &CancellationToken) -> Result<JobResult, JobError> {
        let key = self.spec.key();
        if self.state != JobState::Pending {
            return Err(JobError::AlreadyExecuted { key });
        }
        self.state = JobState::Running;

        let pipeline = Arc::clone(&self.pipeline);
        let stages = match pipeline.resolve(
            self.spec.start_stage.as_deref(),
            self.spec.end_stage.as_deref(),
        ) {
            Ok(stages) => stages,
            Err(source) => {
                self.state = JobState::Completed(JobStatus::Failed);
                return Err(JobError::Pipeline { key, source });
            }
        };

        // Read before this run overwrites it.
        let prior = if self.options.resume {
            load_job_record(&self.spec.work_dir.join(JOB_RECORD_FILE)).ok()
        } else {
            None
        };

        if let Err(e) = self.prepare_work_dir() {
            self.state = JobState::Completed(JobStatus::Failed);
            return Err(e);
        }

        let started_at = Utc::now();
        let deadline = self.options.job_timeout.map(|t| Instant::now() + t);
        let vars = TemplateVars::for_job(&self.spec.identity, &self.spec.work_dir);

        let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(stages.len());
        let mut stop = false;
        let mut interrupted = false;
        let mut budget_exhausted = false;

        for stage in stages {
            if stop {
                outcomes.push(StageOutcome::skipped(stage));
                continue;
            }
            if cancel.is_cancelled() {
                interrupted = true;
                stop = true;
                outcomes.push(StageOutcome::skipped(stage));
                continue;
            }

            let stage_vars = vars.with_stage(stage.name());

            if self.options.resume && self.is_fresh(stage, &stage_vars, prior.as_ref()) {
                debug!("[{}] {}: up to date", key, stage.name());
                let outcome = StageOutcome::resumed(stage);
                self.emit(BatchEvent::StageFinished {
                    key: key.clone(),
                    stage: stage.name().to_string(),
                    status: outcome.status,
                    duration: outcome.duration,
                    resumed: true,
                })
                .await;
                outcomes.push(outcome);
                continue;
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let timeout = match remaining {
                Some(left) => left.min(stage.timeout()),
                None => stage.timeout(),
            };
            let budget_bound = remaining.is_some_and(|left| left <= stage.timeout());

            if timeout.is_zero() {
                warn!("[{}] {}: job time budget exhausted", key, stage.name());
                budget_exhausted = true;
                stop = true;
                outcomes.push(
                    StageOutcome::new(stage, StageStatus::Timeout, Duration::ZERO)
                        .with_detail("job time budget exhausted"),
                );
                continue;
            }

            self.emit(BatchEvent::StageStarted {
                key: key.clone(),
                stage: stage.name().to_string(),
            })
            .await;

            let ctx = StageContext {
                job_key: &key,
                work_dir: &self.spec.work_dir,
                vars: &stage_vars,
                params: &self.spec.identity.params,
            };
            let mut outcome = self.executor.run(stage, &ctx, timeout, cancel).await;

            if outcome.status == StageStatus::Timeout && budget_bound {
                budget_exhausted = true;
                stop = true;
                outcome.detail = Some("job time budget exhausted".to_string());
            }
            if outcome.status == StageStatus::Cancelled {
                interrupted = true;
                stop = true;
            }
            if outcome.is_fatal_failure() {
                stop = true;
            }

            if outcome.status.is_success() {
                info!("[{}] {}: {}", key, stage.name(), outcome.status);
            } else {
                warn!(
                    "[{}] {}: {}{}",
                    key,
                    stage.name(),
                    outcome.status,
                    outcome
                        .detail
                        .as_deref()
                        .map(|d| format!(" ({})", d))
                        .unwrap_or_default()
                );
            }

            self.emit(BatchEvent::StageFinished {
                key: key.clone(),
                stage: stage.name().to_string(),
                status: outcome.status,
                duration: outcome.duration,
                resumed: false,
            })
            .await;
            outcomes.push(outcome);
        }

        let (derived, degraded) = JobResult::derive_status(&outcomes);
        let status = match derived {
            JobStatus::Success | JobStatus::Skipped if budget_exhausted => JobStatus::TimedOut,
            JobStatus::Success | JobStatus::Skipped if interrupted => JobStatus::Cancelled,
            other => other,
        };

        let metrics = extract_metrics(&self.spec, &outcomes);

        let result = JobResult {
            key: key.clone(),
            task: self.spec.task.clone(),
            identity: self.spec.identity.clone(),
            work_dir: self.spec.work_dir.clone(),
            status,
            degraded: degraded && status == JobStatus::Success,
            attempts: self.attempt,
            stages: outcomes,
            metrics,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            error: None,
        };

        if let Err(e) = write_job_record(&result) {
            warn!("[{}] failed to write job record: {}", key, e);
        }

        self.state = JobState::Completed(status);
        Ok(result)
    }
}

/// QoR metrics from the job directory, reading the log of the last stage
/// that actually ran.
pub(crate) fn extract_metrics(spec: &JobSpec, outcomes: &[StageOutcome]) -> BTreeMap<String, f64> {
    match outcomes
        .iter()
        .rev()
        .find(|o| !matches!(o.status, StageStatus::Skipped | StageStatus::MissingInput))
    {
        Some(last) => {
            let log = stage_log_path(&spec.work_dir, &last.stage);
            spec.qor.extract(&spec.work_dir, Some(&log))
        }
        None => BTreeMap::new(),
    }
}
