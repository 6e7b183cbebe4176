//! The `compare` command: check a finished batch against a baseline.

use std::path::Path;
use std::process::ExitCode;

use console::style;

use cadflow::report::{BatchReport, PassRequirements, RegressionChecker};

use crate::cli::helpers::EXIT_FAILED;

pub fn cmd_compare(
    report: &Path,
    baseline: &Path,
    tolerance: f64,
    pass_requirements: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let current = BatchReport::load(report)?;
    let baseline_report = BatchReport::load(baseline)?;

    let mut checker = RegressionChecker::new(tolerance);
    if let Some(path) = pass_requirements {
        checker = checker.with_requirements(PassRequirements::load(path)?);
    }

    let regressions = checker.compare(&current.jobs, &baseline_report);
    if regressions.is_empty() {
        println!(
            "{} No regressions ({} jobs compared)",
            style("✓").green(),
            baseline_report.jobs.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} {} regression(s) against {}",
        style("!").yellow(),
        regressions.len(),
        baseline.display()
    );
    for regression in &regressions {
        println!("  {} {}", style("✗").red(), regression);
    }
    Ok(ExitCode::from(EXIT_FAILED))
}
