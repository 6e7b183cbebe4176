//! Shared helper functions for CLI commands.

use std::process::ExitCode;

use console::style;

use cadflow::models::JobStatus;
use cadflow::report::{BatchOutcome, BatchReport};

/// Some job failed, timed out, was skipped, or regressed.
pub const EXIT_FAILED: u8 = 1;
/// The batch was cancelled.
pub const EXIT_CANCELLED: u8 = 2;
/// Anything that went wrong before dispatch.
pub const EXIT_CONFIG: u8 = 3;

pub fn exit_code(report: &BatchReport) -> ExitCode {
    match report.outcome() {
        BatchOutcome::Passed => ExitCode::SUCCESS,
        BatchOutcome::Failed => ExitCode::from(EXIT_FAILED),
        BatchOutcome::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}

pub fn status_style(status: JobStatus) -> String {
    match status {
        JobStatus::Success => style(status.as_str()).green().to_string(),
        JobStatus::Failed | JobStatus::TimedOut => style(status.as_str()).red().to_string(),
        JobStatus::Cancelled | JobStatus::Skipped => style(status.as_str()).yellow().to_string(),
    }
}

/// Truncate a string to at most `max_len` characters.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print the end-of-batch summary.
pub fn print_summary(report: &BatchReport) {
    let c = &report.counts;
    println!();
    println!("{}", style("Batch Summary").bold());
    println!("{}", "-".repeat(60));
    println!("  {:<12} {}", "jobs", c.total);
    println!("  {:<12} {}", style("success").green(), c.success);
    if c.degraded > 0 {
        println!("  {:<12} {}", style("degraded").yellow(), c.degraded);
    }
    if c.failed > 0 {
        println!("  {:<12} {}", style("failed").red(), c.failed);
    }
    if c.timed_out > 0 {
        println!("  {:<12} {}", style("timed out").red(), c.timed_out);
    }
    if c.cancelled > 0 {
        println!("  {:<12} {}", style("cancelled").yellow(), c.cancelled);
    }
    if c.skipped > 0 {
        println!("  {:<12} {}", style("skipped").yellow(), c.skipped);
    }

    let failed: Vec<_> = report.failed_jobs().collect();
    if !failed.is_empty() {
        println!();
        for (key, job) in failed {
            let stage = job
                .stages
                .iter()
                .find(|s| s.status.is_failure())
                .map(|s| format!("{} {}", s.name, s.status))
                .unwrap_or_default();
            println!(
                "  {} {:<50} {} {}",
                style("✗").red(),
                truncate(key, 50),
                status_style(job.status),
                style(stage).dim()
            );
        }
    }

    if !report.geomean.is_empty() {
        println!();
        println!("{}", style("Geometric means").bold());
        for (metric, value) in &report.geomean {
            println!("  {:<24} {:.4}", metric, value);
        }
    }

    print_regressions(report);
}

pub fn print_regressions(report: &BatchReport) {
    if report.regressions.is_empty() {
        return;
    }
    println!();
    println!(
        "{} {} regression(s)",
        style("!").yellow(),
        report.regressions.len()
    );
    for regression in &report.regressions {
        println!("  {} {}", style("✗").red(), regression);
    }
}
