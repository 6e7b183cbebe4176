//! Progress display driven by scheduler events.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cadflow::models::JobStatus;
use cadflow::scheduler::BatchEvent;

use super::helpers::{status_style, truncate};

/// Consume batch events until the scheduler drops its sender.
pub fn spawn_progress(mut events: mpsc::Receiver<BatchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pb: Option<ProgressBar> = None;

        // Print above the bar when one is active.
        let say = |pb: &Option<ProgressBar>, line: String| match pb {
            Some(progress) => progress.suspend(|| println!("{}", line)),
            None => println!("{}", line),
        };

        while let Some(event) = events.recv().await {
            match event {
                BatchEvent::BatchStarted { total, workers } => {
                    println!(
                        "{} Running {} jobs on {} workers",
                        style("→").cyan(),
                        total,
                        workers
                    );
                    let progress = ProgressBar::new(total as u64);
                    progress.set_style(
                        ProgressStyle::default_bar()
                            .template(
                                "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}",
                            )
                            .unwrap_or_else(|_| ProgressStyle::default_bar())
                            .progress_chars("█▓░"),
                    );
                    pb = Some(progress);
                }
                BatchEvent::JobStarted { key, attempt, .. } => {
                    if let Some(progress) = &pb {
                        if attempt > 1 {
                            progress.set_message(format!("{} (attempt {})", truncate(&key, 60), attempt));
                        } else {
                            progress.set_message(truncate(&key, 60));
                        }
                    }
                }
                BatchEvent::StageStarted { key, stage } => {
                    if let Some(progress) = &pb {
                        progress.set_message(format!("{} {}", truncate(&key, 60), style(stage).dim()));
                    }
                }
                BatchEvent::StageFinished {
                    key,
                    stage,
                    status,
                    duration,
                    resumed,
                } => {
                    if resumed {
                        tracing::debug!("{}: {} up to date", key, stage);
                    } else if status.is_failure() {
                        say(
                            &pb,
                            format!(
                                "  {} {} {} {} after {:.1}s",
                                style("!").yellow(),
                                key,
                                stage,
                                style(status).red(),
                                duration.as_secs_f64()
                            ),
                        );
                    }
                }
                BatchEvent::JobRetrying {
                    key,
                    next_attempt,
                    reason,
                } => {
                    say(
                        &pb,
                        format!(
                            "  {} {} retrying (attempt {}): {}",
                            style("↻").cyan(),
                            key,
                            next_attempt,
                            reason
                        ),
                    );
                }
                BatchEvent::JobFinished {
                    key,
                    status,
                    degraded,
                    attempts,
                } => {
                    if status != JobStatus::Success {
                        say(
                            &pb,
                            format!(
                                "  {} {} {}{}",
                                style("✗").red(),
                                key,
                                status_style(status),
                                if attempts > 1 {
                                    format!(" after {} attempts", attempts)
                                } else {
                                    String::new()
                                }
                            ),
                        );
                    } else if degraded {
                        say(
                            &pb,
                            format!("  {} {} {}", style("~").yellow(), key, style("degraded").yellow()),
                        );
                    }
                    if let Some(progress) = &pb {
                        progress.inc(1);
                    }
                }
                BatchEvent::JobSkipped { .. } => {
                    if let Some(progress) = &pb {
                        progress.inc(1);
                    }
                }
            }
        }

        if let Some(progress) = pb {
            progress.finish_and_clear();
        }
    })
}
