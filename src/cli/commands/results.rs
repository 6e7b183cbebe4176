//! `run --parse`, `--create-golden` and `--check-golden`: work on the
//! latest run's results without running any tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tracing::info;

use cadflow::config::Config;
use cadflow::models::JobSpec;
use cadflow::pipeline::PipelineDefinition;
use cadflow::report::{Aggregator, BatchReport, RegressionChecker, REPORT_FILE};
use cadflow::scheduler::{Scheduler, SchedulerOptions};
use cadflow::storage;
use cadflow::task::TaskFile;
use cadflow::StageRunner;

use crate::cli::helpers::{exit_code, print_summary, EXIT_FAILED};

/// Golden report file kept next to a task's config file.
pub const GOLDEN_FILE: &str = "golden_report.json";

pub struct ResultsArgs {
    pub parse: bool,
    pub create_golden: bool,
    pub check_golden: bool,
}

fn golden_path(task: &TaskFile) -> PathBuf {
    task.path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(GOLDEN_FILE)
}

/// Parse first, then save goldens, then check them, against the latest
/// `runNNN` under `work_root`.
pub fn cmd_results(
    config: &Config,
    pipeline: Arc<PipelineDefinition>,
    tasks: &[TaskFile],
    specs: Vec<JobSpec>,
    aggregator: Aggregator,
    work_root: &Path,
    args: ResultsArgs,
) -> anyhow::Result<ExitCode> {
    let batch_dir = storage::latest_run_dir(work_root)
        .with_context(|| format!("cannot read {}", work_root.display()))?
        .with_context(|| format!("no runs found under {}", work_root.display()))?;
    info!("Using results in {}", batch_dir.display());

    let mut code = ExitCode::SUCCESS;

    let report = if args.parse {
        let options = SchedulerOptions::from_flow(&config.flow, &batch_dir);
        let executor = Arc::new(StageRunner::new(config.flow.kill_grace()));
        let scheduler = Scheduler::new(pipeline, executor, options).with_aggregator(aggregator);
        let report = scheduler.parse_batch(specs)?;
        print_summary(&report);
        println!(
            "\n{} Parsed results into {}",
            style("→").cyan(),
            style(batch_dir.join(REPORT_FILE).display()).bold()
        );
        code = exit_code(&report);
        report
    } else {
        BatchReport::load(&batch_dir.join(REPORT_FILE))?
    };

    if args.create_golden {
        for task in tasks {
            let path = golden_path(task);
            report
                .for_task(&task.name)
                .save(&path)
                .with_context(|| format!("cannot write golden report for task {}", task.name))?;
            println!(
                "{} Golden results for {} -> {}",
                style("✓").green(),
                task.name,
                path.display()
            );
        }
    }

    if args.check_golden {
        let mut failures = 0;
        for task in tasks {
            let path = golden_path(task);
            let golden = BatchReport::load(&path)
                .with_context(|| format!("no golden results for task {}", task.name))?;

            let mut checker = RegressionChecker::new(config.flow.qor_tolerance);
            if let Some((_, reqs)) = &task.pass_requirements {
                checker = checker.with_requirements(reqs.clone());
            }
            let regressions = checker.compare(&report.for_task(&task.name).jobs, &golden);

            if regressions.is_empty() {
                println!("{} {}: matches golden results", style("✓").green(), task.name);
                continue;
            }
            println!(
                "{} {}: {} regression(s) against {}",
                style("✗").red(),
                task.name,
                regressions.len(),
                path.display()
            );
            for regression in &regressions {
                println!("    {}", regression);
            }
            failures += regressions.len();
        }
        if failures > 0 {
            code = ExitCode::from(EXIT_FAILED);
        }
    }

    Ok(code)
}
