//! The `run` command.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cadflow::config::{Config, DuplicatePolicy};
use cadflow::pipeline::PipelineDefinition;
use cadflow::report::{Aggregator, BatchReport, PassRequirements, RegressionChecker};
use cadflow::scheduler::{BatchError, BatchEvent, Scheduler, SchedulerOptions};
use cadflow::storage;
use cadflow::task::{apply_stage_override, load_list_file, load_tasks};
use cadflow::StageRunner;

use super::results;
use crate::cli::helpers::{exit_code, print_summary, EXIT_FAILED};
use crate::cli::progress::spawn_progress;

pub struct RunArgs {
    pub tasks: Vec<PathBuf>,
    pub list_files: Vec<PathBuf>,
    pub start_stage: Option<String>,
    pub end_stage: Option<String>,
    pub jobs: Option<usize>,
    pub retries: Option<u32>,
    pub resume: bool,
    pub baseline: Option<PathBuf>,
    pub work_root: Option<PathBuf>,
    pub frontend: Option<String>,
    pub job_timeout: Option<u64>,
    pub on_duplicate: Option<DuplicatePolicy>,
    pub pass_requirements: Option<PathBuf>,
    pub parse: bool,
    pub create_golden: bool,
    pub check_golden: bool,
}

impl RunArgs {
    /// Work on the latest run's results instead of running tools.
    fn results_only(&self) -> bool {
        self.parse || self.create_golden || self.check_golden
    }
}

pub async fn cmd_run(mut config: Config, args: RunArgs) -> anyhow::Result<ExitCode> {
    if let Some(jobs) = args.jobs {
        config.flow.max_parallel = jobs;
    }
    if let Some(retries) = args.retries {
        config.flow.retries = retries;
    }
    if let Some(secs) = args.job_timeout {
        config.flow.job_timeout_secs = secs;
    }
    if let Some(policy) = args.on_duplicate {
        config.flow.on_duplicate = policy;
    }

    let pipeline = Arc::new(PipelineDefinition::from_config(&config, args.frontend.as_deref())?);
    let mut task_paths = args.tasks.clone();
    for list in &args.list_files {
        task_paths.extend(load_list_file(list)?);
    }
    let tasks = load_tasks(&task_paths, &pipeline)?;

    let mut specs: Vec<_> = tasks.iter().flat_map(|t| t.jobs.iter().cloned()).collect();
    apply_stage_override(&mut specs, args.start_stage.as_deref(), args.end_stage.as_deref());

    let aggregator = match &args.baseline {
        Some(path) => {
            let baseline = BatchReport::load(path)?;
            let mut checker = RegressionChecker::new(config.flow.qor_tolerance);
            let requirements = match &args.pass_requirements {
                Some(p) => Some(PassRequirements::load(p)?),
                None => tasks
                    .iter()
                    .find_map(|t| t.pass_requirements.as_ref())
                    .map(|(_, reqs)| reqs.clone()),
            };
            if let Some(reqs) = requirements {
                checker = checker.with_requirements(reqs);
            }
            Aggregator::new().with_baseline(baseline, checker)
        }
        None => Aggregator::new(),
    };

    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let work_root = args
        .work_root
        .clone()
        .unwrap_or_else(|| config.work_root(&cwd));

    if args.results_only() {
        let opts = results::ResultsArgs {
            parse: args.parse,
            create_golden: args.create_golden,
            check_golden: args.check_golden,
        };
        return results::cmd_results(&config, pipeline, &tasks, specs, aggregator, &work_root, opts);
    }

    let batch_dir = storage::select_run_dir(&work_root, args.resume)
        .with_context(|| format!("cannot create run directory under {}", work_root.display()))?;
    info!("Batch directory {}", batch_dir.display());

    let mut options = SchedulerOptions::from_flow(&config.flow, &batch_dir);
    options.resume = args.resume;

    let (event_tx, event_rx) = mpsc::channel::<BatchEvent>(256);
    let executor = Arc::new(StageRunner::new(config.flow.kill_grace()));
    let scheduler = Scheduler::new(pipeline, executor, options)
        .with_aggregator(aggregator)
        .with_events(event_tx);

    let cancel = scheduler.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Cancelling batch, stopping running stages...",
                style("!").yellow()
            );
            cancel.cancel();
        }
    });

    let progress = spawn_progress(event_rx);
    let outcome = scheduler.run_batch(specs, config.flow.max_parallel).await;
    drop(scheduler);
    ctrl_c.abort();
    let _ = progress.await;

    let report = match outcome {
        Ok(report) => report,
        Err(BatchError::ReportWrite { report, source }) => {
            eprintln!("{} {:#}", style("error:").red().bold(), anyhow::Error::from(source));
            print_summary(&report);
            return Ok(ExitCode::from(EXIT_FAILED));
        }
        Err(e) => {
            // Nothing ran, so don't leave an empty run directory behind.
            if !args.resume {
                let _ = std::fs::remove_dir(&batch_dir);
            }
            return Err(e.into());
        }
    };

    print_summary(&report);
    println!(
        "\n{} Results in {}",
        style("→").cyan(),
        style(batch_dir.display()).bold()
    );
    if report.cancelled {
        warn!("Batch was cancelled");
    }

    Ok(exit_code(&report))
}
