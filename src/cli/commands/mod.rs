//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod compare;
mod list;
mod results;
mod run;
mod stages;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use cadflow::config::{Config, DuplicatePolicy};

#[derive(Parser)]
#[command(name = "cadflow")]
#[command(about = "Batch runner for FPGA CAD tool flows")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true, env = "CADFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of one or more task files
    Run {
        /// Task files or task directories
        #[arg(required_unless_present = "list_file")]
        tasks: Vec<PathBuf>,
        /// Files listing task paths, one per line
        #[arg(short = 'l', long, num_args = 1..)]
        list_file: Vec<PathBuf>,
        /// First stage to run for every job
        #[arg(long)]
        start_stage: Option<String>,
        /// Last stage to run for every job
        #[arg(long)]
        end_stage: Option<String>,
        /// Maximum concurrent jobs (0 = one per CPU core)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
        /// Extra attempts for jobs failing in a flaky stage
        #[arg(long)]
        retries: Option<u32>,
        /// Reuse the latest run directory and skip up-to-date stages
        #[arg(long)]
        resume: bool,
        /// Baseline batch_report.json to check for regressions
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// Directory holding the runNNN batch directories
        #[arg(long)]
        work_root: Option<PathBuf>,
        /// Synthesis frontend (key into [frontends])
        #[arg(long)]
        frontend: Option<String>,
        /// Wall-clock budget per job in seconds (0 = none)
        #[arg(long)]
        job_timeout: Option<u64>,
        /// What to do with duplicate jobs
        #[arg(long, value_enum)]
        on_duplicate: Option<DuplicatePolicy>,
        /// Pass requirements file for the baseline comparison
        #[arg(long)]
        pass_requirements: Option<PathBuf>,
        /// Re-extract QoR of the latest run into a new report, without running
        #[arg(long)]
        parse: bool,
        /// Save the latest run's results as each task's golden report
        #[arg(long)]
        create_golden: bool,
        /// Check the latest run against each task's golden report
        #[arg(long)]
        check_golden: bool,
    },

    /// Show the jobs a task file expands to without running anything
    List {
        /// Task files or task directories
        #[arg(required = true)]
        tasks: Vec<PathBuf>,
        #[arg(long)]
        start_stage: Option<String>,
        #[arg(long)]
        end_stage: Option<String>,
        #[arg(long)]
        frontend: Option<String>,
    },

    /// Show the configured pipeline and whether each tool is installed
    Stages {
        #[arg(long)]
        frontend: Option<String>,
    },

    /// Compare two batch reports
    Compare {
        /// Report to check
        report: PathBuf,
        /// Baseline report
        baseline: PathBuf,
        /// Relative tolerance for metrics without a pass requirement
        #[arg(long)]
        tolerance: Option<f64>,
        #[arg(long)]
        pass_requirements: Option<PathBuf>,
    },
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(p) => Config::load_from_path(p).await?,
        None => Config::load().await?,
    };
    if let Some(source) = &config.source_path {
        tracing::info!("Loaded config from {}", source.display());
    }
    Ok(config)
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref()).await?;

    match cli.command {
        Commands::Run {
            tasks,
            list_file,
            start_stage,
            end_stage,
            jobs,
            retries,
            resume,
            baseline,
            work_root,
            frontend,
            job_timeout,
            on_duplicate,
            pass_requirements,
            parse,
            create_golden,
            check_golden,
        } => {
            let args = run::RunArgs {
                tasks,
                list_files: list_file,
                start_stage,
                end_stage,
                jobs,
                retries,
                resume,
                baseline,
                work_root,
                frontend,
                job_timeout,
                on_duplicate,
                pass_requirements,
                parse,
                create_golden,
                check_golden,
            };
            run::cmd_run(config, args).await
        }
        Commands::List {
            tasks,
            start_stage,
            end_stage,
            frontend,
        } => list::cmd_list(
            &config,
            &tasks,
            start_stage.as_deref(),
            end_stage.as_deref(),
            frontend.as_deref(),
        ),
        Commands::Stages { frontend } => stages::cmd_stages(&config, frontend.as_deref()),
        Commands::Compare {
            report,
            baseline,
            tolerance,
            pass_requirements,
        } => compare::cmd_compare(
            &report,
            &baseline,
            tolerance.unwrap_or(config.flow.qor_tolerance),
            pass_requirements.as_deref(),
        ),
    }
}
