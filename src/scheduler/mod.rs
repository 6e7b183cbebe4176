//! Batch scheduling: dedupe, validation, a bounded worker pool, retries
//! and cancellation.

mod error;
mod events;
mod retry;

pub use error::BatchError;
pub use events::BatchEvent;
pub use retry::RetryPolicy;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{resolve_parallelism, DuplicatePolicy, FlowConfig};
use crate::job::{extract_metrics, Job, JobOptions};
use crate::models::{JobIdentity, JobResult, JobSpec};
use crate::pipeline::{check_param_names, PipelineDefinition, Stage, TemplateVars};
use crate::report::{
    load_job_record, write_job_record, write_report, Aggregator, BatchReport, JOB_RECORD_FILE,
    REPORT_FILE, TSV_FILE,
};
use crate::runner::StageExecutor;
use crate::storage;

/// Knobs for one batch.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Directory the job directories are created under (`.../runNNN`).
    pub batch_dir: PathBuf,
    pub retry: RetryPolicy,
    pub on_duplicate: DuplicatePolicy,
    /// Skip stages whose outputs are already up to date.
    pub resume: bool,
    pub job_timeout: Option<Duration>,
}

impl SchedulerOptions {
    pub fn new(batch_dir: impl Into<PathBuf>) -> Self {
        Self {
            batch_dir: batch_dir.into(),
            retry: RetryPolicy::none(),
            on_duplicate: DuplicatePolicy::Reject,
            resume: false,
            job_timeout: None,
        }
    }

    pub fn from_flow(flow: &FlowConfig, batch_dir: impl Into<PathBuf>) -> Self {
        Self {
            batch_dir: batch_dir.into(),
            retry: RetryPolicy::new(flow.retries, flow.flaky_stages.iter().cloned()),
            on_duplicate: flow.on_duplicate,
            resume: false,
            job_timeout: flow.job_timeout(),
        }
    }
}

fn lock_queue(queue: &Mutex<VecDeque<JobSpec>>) -> MutexGuard<'_, VecDeque<JobSpec>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stages_for<'a>(pipeline: &'a PipelineDefinition, spec: &JobSpec) -> &'a [Stage] {
    pipeline
        .resolve(spec.start_stage.as_deref(), spec.end_stage.as_deref())
        .unwrap_or(&[])
}

/// Runs batches of jobs over a shared pipeline.
pub struct Scheduler {
    pipeline: Arc<PipelineDefinition>,
    executor: Arc<dyn StageExecutor>,
    options: SchedulerOptions,
    aggregator: Aggregator,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<BatchEvent>>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        executor: Arc<dyn StageExecutor>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            pipeline,
            executor,
            options,
            aggregator: Aggregator::new(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that cancels the batch: no new jobs start and running stages
    /// are stopped.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    async fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Validate job specs before anything runs.
    ///
    /// Removes or rejects duplicates, checks that no two jobs share a
    /// working directory, resolves each stage range and expands every
    /// template. Assigns each job its working directory.
    pub fn prepare(&self, specs: Vec<JobSpec>) -> Result<Vec<JobSpec>, BatchError> {
        let mut identities: HashMap<JobIdentity, String> = HashMap::new();
        let mut dirs: HashMap<String, String> = HashMap::new();
        let mut prepared = Vec::with_capacity(specs.len());

        for mut spec in specs {
            let key = spec.key();
            let origin = spec.origin_label();

            if let Some(first) = identities.get(&spec.identity) {
                match self.options.on_duplicate {
                    DuplicatePolicy::Reject => {
                        return Err(BatchError::DuplicateJob {
                            key,
                            first: first.clone(),
                            second: origin,
                        })
                    }
                    DuplicatePolicy::KeepFirst => {
                        warn!("Ignoring duplicate job {} at {} (first at {})", key, origin, first);
                        continue;
                    }
                }
            }

            if let Some(first) = dirs.get(&key) {
                return Err(BatchError::KeyCollision {
                    key,
                    first: first.clone(),
                    second: origin,
                });
            }

            let top = key.split('/').next().unwrap_or_default();
            if let Some(file) = [REPORT_FILE, TSV_FILE].into_iter().find(|f| *f == top) {
                return Err(BatchError::ReservedKey { key, origin, file });
            }

            check_param_names(spec.identity.params.keys()).map_err(|source| {
                BatchError::Params {
                    key: key.clone(),
                    origin: origin.clone(),
                    source,
                }
            })?;

            spec.work_dir = storage::job_dir(&self.options.batch_dir, &key);

            let stages = self
                .pipeline
                .resolve(spec.start_stage.as_deref(), spec.end_stage.as_deref())
                .map_err(|source| BatchError::StageRange {
                    key: key.clone(),
                    origin: origin.clone(),
                    source,
                })?;

            let vars = TemplateVars::for_job(&spec.identity, &spec.work_dir);
            for stage in stages {
                stage
                    .validate(&vars.with_stage(stage.name()), &spec.work_dir)
                    .map_err(|source| BatchError::Template {
                        key: key.clone(),
                        origin: origin.clone(),
                        stage: stage.name().to_string(),
                        source,
                    })?;
            }

            identities.insert(spec.identity.clone(), origin.clone());
            dirs.insert(key, origin);
            prepared.push(spec);
        }

        Ok(prepared)
    }

    /// Run already-prepared jobs on up to `max_parallel` workers
    /// (0 = one per core). Returns one result per job, including jobs that
    /// were never dispatched because the batch was cancelled.
    pub async fn run_jobs(&self, specs: Vec<JobSpec>, max_parallel: usize) -> Vec<JobResult> {
        let total = specs.len();
        let workers = resolve_parallelism(max_parallel).min(total.max(1));
        info!("Running {} jobs on {} workers", total, workers);
        self.emit(BatchEvent::BatchStarted { total, workers }).await;

        let keys: Vec<JobSpec> = specs.clone();
        let queue = Arc::new(Mutex::new(VecDeque::from(specs)));
        let (result_tx, mut result_rx) = mpsc::channel::<JobResult>(total.max(1));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                queue: queue.clone(),
                pipeline: self.pipeline.clone(),
                executor: self.executor.clone(),
                retry: self.options.retry.clone(),
                resume: self.options.resume,
                job_timeout: self.options.job_timeout,
                cancel: self.cancel.clone(),
                events: self.events.clone(),
                results: result_tx.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        for (worker_id, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!("Worker {} panicked: {}", worker_id, e);
            }
        }

        let leftover: Vec<JobSpec> = lock_queue(&queue).drain(..).collect();
        if !leftover.is_empty() {
            warn!("Batch cancelled, {} jobs never started", leftover.len());
        }
        for spec in leftover {
            self.emit(BatchEvent::JobSkipped { key: spec.key() }).await;
            results.push(JobResult::not_dispatched(
                &spec,
                stages_for(&self.pipeline, &spec),
            ));
        }

        let reported: HashSet<String> = results.iter().map(|r| r.key.clone()).collect();
        for spec in keys.iter().filter(|s| !reported.contains(&s.key())) {
            results.push(JobResult::setup_failed(
                spec,
                stages_for(&self.pipeline, spec),
                0,
                "worker terminated unexpectedly",
            ));
        }

        results
    }

    /// Prepare, run and summarize a batch, writing the report into the
    /// batch directory.
    ///
    /// A failed report write after the jobs ran is returned as
    /// [`BatchError::ReportWrite`], which still carries the report.
    pub async fn run_batch(
        &self,
        specs: Vec<JobSpec>,
        max_parallel: usize,
    ) -> Result<BatchReport, BatchError> {
        let prepared = self.prepare(specs)?;

        std::fs::create_dir_all(&self.options.batch_dir).map_err(|source| BatchError::BatchDir {
            path: self.options.batch_dir.clone(),
            source,
        })?;

        let results = self.run_jobs(prepared, max_parallel).await;
        let report = self.aggregator.aggregate(&results);

        match write_report(&self.options.batch_dir, &report) {
            Ok(path) => {
                info!("Wrote {}", path.display());
                Ok(report)
            }
            Err(source) => {
                error!("Failed to write batch report: {}", source);
                Err(BatchError::ReportWrite {
                    report: Box::new(report),
                    source,
                })
            }
        }
    }

    /// Rebuild the report of an existing batch directory without running
    /// any tool.
    ///
    /// Each job's metrics are extracted again from its directory and its
    /// `job_result.json` is rewritten. Jobs without a record are reported as
    /// skipped.
    pub fn parse_batch(&self, specs: Vec<JobSpec>) -> Result<BatchReport, BatchError> {
        let prepared = self.prepare(specs)?;

        let mut results = Vec::with_capacity(prepared.len());
        for spec in &prepared {
            let record_path = spec.work_dir.join(JOB_RECORD_FILE);
            let mut result = match load_job_record(&record_path) {
                Ok(record) => record,
                Err(e) => {
                    warn!("[{}] no usable job record: {}", spec.key(), e);
                    results.push(JobResult::not_dispatched(spec, stages_for(&self.pipeline, spec)));
                    continue;
                }
            };

            result.work_dir = spec.work_dir.clone();
            result.metrics = extract_metrics(spec, &result.stages);
            if let Err(e) = write_job_record(&result) {
                warn!("[{}] failed to write job record: {}", spec.key(), e);
            }
            results.push(result);
        }

        let report = self.aggregator.aggregate(&results);
        match write_report(&self.options.batch_dir, &report) {
            Ok(path) => {
                info!("Wrote {}", path.display());
                Ok(report)
            }
            Err(source) => Err(BatchError::ReportWrite {
                report: Box::new(report),
                source,
            }),
        }
    }
}

/// State owned by one worker task.
struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<JobSpec>>>,
    pipeline: Arc<PipelineDefinition>,
    executor: Arc<dyn StageExecutor>,
    retry: RetryPolicy,
    resume: bool,
    job_timeout: Option<Duration>,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<BatchEvent>>,
    results: mpsc::Sender<JobResult>,
}

impl Worker {
    async fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn run(self) {
        loop {
            // Checked under the queue lock so no job starts after cancellation.
            let spec = {
                let mut queue = lock_queue(&self.queue);
                if self.cancel.is_cancelled() {
                    None
                } else {
                    queue.pop_front()
                }
            };
            let Some(spec) = spec else { break };

            let result = self.run_with_retries(spec).await;
            if self.results.send(result).await.is_err() {
                break;
            }
        }
    }

    async fn run_with_retries(&self, spec: JobSpec) -> JobResult {
        let key = spec.key();
        let mut attempt = 1;

        loop {
            self.emit(BatchEvent::JobStarted {
                key: key.clone(),
                attempt,
                worker: self.id,
            })
            .await;

            let options = JobOptions {
                resume: self.resume && attempt == 1,
                clean: !self.resume || attempt > 1,
                job_timeout: self.job_timeout,
            };
            let mut job = Job::new(spec.clone(), self.pipeline.clone(), self.executor.clone())
                .with_options(options)
                .with_attempt(attempt);
            if let Some(tx) = &self.events {
                job = job.with_events(tx.clone());
            }

            let result = match job.execute(&self.cancel).await {
                Ok(result) => result,
                Err(e) => {
                    error!("{}", e);
                    JobResult::setup_failed(
                        &spec,
                        stages_for(&self.pipeline, &spec),
                        attempt,
                        e.to_string(),
                    )
                }
            };

            if !self.cancel.is_cancelled() {
                if let Some(reason) = self.retry.should_retry(&result, attempt) {
                    warn!("[{}] attempt {} failed ({}), retrying", key, attempt, reason);
                    self.emit(BatchEvent::JobRetrying {
                        key: key.clone(),
                        next_attempt: attempt + 1,
                        reason,
                    })
                    .await;
                    attempt += 1;
                    continue;
                }
            }

            info!("[{}] {}", key, result.status);
            self.emit(BatchEvent::JobFinished {
                key,
                status: result.status,
                degraded: result.degraded,
                attempts: result.attempts,
            })
            .await;
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, StageOutcome, StageStatus};
    use crate::pipeline::CommandTemplate;
    use crate::runner::StageContext;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts concurrent invocations; fails `route` for circuits named `bad`
    /// until `flaky_failures` attempts have been used up.
    #[derive(Default)]
    struct CountingTool {
        running: AtomicUsize,
        peak: AtomicUsize,
        invocations: AtomicUsize,
        flaky_failures: AtomicUsize,
    }

    #[async_trait]
    impl StageExecutor for CountingTool {
        async fn run(
            &self,
            stage: &Stage,
            ctx: &StageContext<'_>,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> StageOutcome {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let bad = ctx.vars.get("circuit_name") == Some("bad");
            let status = if bad && stage.name() == "route" {
                let left = self.flaky_failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.flaky_failures.fetch_sub(1, Ordering::SeqCst);
                    StageStatus::Timeout
                } else {
                    StageStatus::Success
                }
            } else {
                StageStatus::Success
            };
            StageOutcome::new(stage, status, Duration::from_millis(20))
        }
    }

    fn pipeline() -> Arc<PipelineDefinition> {
        Arc::new(
            PipelineDefinition::new(vec![
                Stage::new("synth", 1, CommandTemplate::new("true")),
                Stage::new("route", 2, CommandTemplate::new("true")),
            ])
            .unwrap(),
        )
    }

    fn spec(circuit: &str) -> JobSpec {
        JobSpec::new("t", JobIdentity::new(format!("{}.v", circuit), "k6.xml"))
    }

    fn scheduler(dir: &TempDir, tool: Arc<CountingTool>, options: impl FnOnce(&mut SchedulerOptions)) -> Scheduler {
        let mut opts = SchedulerOptions::new(dir.path().join("run001"));
        options(&mut opts);
        Scheduler::new(pipeline(), tool, opts)
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(CountingTool::default());
        let sched = scheduler(&dir, tool.clone(), |_| {});
        let specs = (0..8).map(|i| spec(&format!("c{}", i))).collect();

        let report = sched.run_batch(specs, 3).await.unwrap();
        assert_eq!(report.counts.total, 8);
        assert_eq!(report.counts.success, 8);
        assert!(tool.peak.load(Ordering::SeqCst) <= 3);
        assert!(dir.path().join("run001/batch_report.json").exists());
    }

    #[tokio::test]
    async fn test_duplicates_rejected_or_dropped() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir, Arc::new(CountingTool::default()), |_| {});
        let err = sched.prepare(vec![spec("a"), spec("a")]).unwrap_err();
        assert!(matches!(err, BatchError::DuplicateJob { .. }));

        let sched = scheduler(&dir, Arc::new(CountingTool::default()), |o| {
            o.on_duplicate = DuplicatePolicy::KeepFirst
        });
        let prepared = sched.prepare(vec![spec("a"), spec("a"), spec("b")]).unwrap();
        assert_eq!(prepared.len(), 2);
    }

    #[tokio::test]
    async fn test_prepare_assigns_work_dirs_and_validates() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir, Arc::new(CountingTool::default()), |_| {});
        let prepared = sched.prepare(vec![spec("a")]).unwrap();
        assert_eq!(prepared[0].work_dir, dir.path().join("run001/k6/a/common"));

        let backwards = spec("a").with_stage_range(Some("route"), Some("synth"));
        assert!(matches!(
            sched.prepare(vec![backwards]),
            Err(BatchError::StageRange { .. })
        ));

        let mut reserved = spec("a");
        reserved.identity.params.insert("arch".into(), "x".into());
        assert!(matches!(
            sched.prepare(vec![reserved]),
            Err(BatchError::Params { .. })
        ));
    }

    #[tokio::test]
    async fn test_key_collision() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir, Arc::new(CountingTool::default()), |_| {});
        // Same stems, different directories: distinct identities, same key.
        let a = JobSpec::new("t", JobIdentity::new("x/adder.v", "k6.xml"));
        let b = JobSpec::new("t", JobIdentity::new("y/adder.v", "k6.xml"));
        assert!(matches!(
            sched.prepare(vec![a, b]),
            Err(BatchError::KeyCollision { .. })
        ));
    }

    #[tokio::test]
    async fn test_keys_cannot_shadow_batch_files() {
        let dir = TempDir::new().unwrap();
        let sched = scheduler(&dir, Arc::new(CountingTool::default()), |_| {});
        let report_arch = JobSpec::new("t", JobIdentity::new("adder.v", "/a/batch_report.json.xml"));
        assert!(matches!(
            sched.prepare(vec![report_arch]),
            Err(BatchError::ReservedKey { file: REPORT_FILE, .. })
        ));

        let tsv_arch = JobSpec::new("t", JobIdentity::new("adder.v", "parse_results.txt.xml"));
        assert!(matches!(
            sched.prepare(vec![tsv_arch]),
            Err(BatchError::ReservedKey { file: TSV_FILE, .. })
        ));

        // Only the first component is reserved.
        let nested = JobSpec::new("t", JobIdentity::new("batch_report.json.v", "k6.xml"));
        assert!(sched.prepare(vec![nested]).is_ok());
    }

    #[tokio::test]
    async fn test_report_write_failure_keeps_results() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(CountingTool::default());
        let sched = scheduler(&dir, tool.clone(), |_| {});
        std::fs::create_dir_all(dir.path().join("run001/batch_report.json/blocked")).unwrap();

        let err = sched.run_batch(vec![spec("a"), spec("b")], 2).await.unwrap_err();
        match err {
            BatchError::ReportWrite { report, .. } => {
                assert_eq!(report.counts.total, 2);
                assert_eq!(report.counts.success, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_parse_batch_reads_existing_logs() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(CountingTool::default());
        let sched = scheduler(&dir, tool.clone(), |_| {});
        sched.run_batch(vec![spec("a")], 1).await.unwrap();
        let calls = tool.invocations.load(Ordering::SeqCst);

        let job_dir = dir.path().join("run001/k6/a/common");
        std::fs::write(job_dir.join("route.log"), "QOR: wirelength = 812\n").unwrap();

        let report = sched.parse_batch(vec![spec("a"), spec("b")]).unwrap();
        assert_eq!(tool.invocations.load(Ordering::SeqCst), calls);
        assert_eq!(report.jobs["k6/a/common"].status, JobStatus::Success);
        assert_eq!(report.jobs["k6/a/common"].metrics["wirelength"], 812.0);
        assert_eq!(report.jobs["k6/b/common"].status, JobStatus::Skipped);

        let record = load_job_record(&job_dir.join(JOB_RECORD_FILE)).unwrap();
        assert_eq!(record.metrics["wirelength"], 812.0);
        let reloaded = BatchReport::load(&dir.path().join("run001").join(REPORT_FILE)).unwrap();
        assert_eq!(reloaded, report);
    }

    #[tokio::test]
    async fn test_flaky_stage_is_retried() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(CountingTool::default());
        tool.flaky_failures.store(1, Ordering::SeqCst);
        let sched = scheduler(&dir, tool, |o| o.retry = RetryPolicy::new(2, ["route"]));

        let report = sched.run_batch(vec![spec("bad")], 1).await.unwrap();
        let job = &report.jobs["k6/bad/common"];
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(CountingTool::default());
        tool.flaky_failures.store(10, Ordering::SeqCst);
        let sched = scheduler(&dir, tool, |o| o.retry = RetryPolicy::new(1, ["route"]));

        let report = sched.run_batch(vec![spec("bad")], 1).await.unwrap();
        let job = &report.jobs["k6/bad/common"];
        assert_eq!(job.status, JobStatus::TimedOut);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_undispatched_jobs() {
        let dir = TempDir::new().unwrap();
        let tool = Arc::new(CountingTool::default());
        let sched = scheduler(&dir, tool.clone(), |_| {});
        sched.cancellation_token().cancel();

        let report = sched
            .run_batch(vec![spec("a"), spec("b"), spec("c")], 2)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.counts.skipped, 3);
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 0);
        for job in report.jobs.values() {
            assert!(job.stages.iter().all(|s| s.status == StageStatus::Skipped));
        }
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let sched = scheduler(&dir, Arc::new(CountingTool::default()), |_| {}).with_events(tx);

        sched.run_batch(vec![spec("a")], 1).await.unwrap();
        drop(sched);

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert!(matches!(events[0], BatchEvent::BatchStarted { total: 1, .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, BatchEvent::JobFinished { status: JobStatus::Success, .. })));
        let finished_stages = events
            .iter()
            .filter(|e| matches!(e, BatchEvent::StageFinished { .. }))
            .count();
        assert_eq!(finished_stages, 2);
    }
}
