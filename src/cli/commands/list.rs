//! The `list` command: a dry run of task expansion.

use std::path::PathBuf;
use std::process::ExitCode;

use console::style;

use cadflow::config::Config;
use cadflow::pipeline::PipelineDefinition;
use cadflow::task::{apply_stage_override, load_tasks};

use crate::cli::helpers::truncate;

pub fn cmd_list(
    config: &Config,
    tasks: &[PathBuf],
    start_stage: Option<&str>,
    end_stage: Option<&str>,
    frontend: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let pipeline = PipelineDefinition::from_config(config, frontend)?;
    let mut total = 0;

    for mut task in load_tasks(tasks, &pipeline)? {
        apply_stage_override(&mut task.jobs, start_stage, end_stage);

        println!(
            "\n{} {}",
            style(format!("Task: {}", task.name)).bold(),
            style(task.path.display()).dim()
        );
        println!("{}", "-".repeat(80));
        println!("{:<50} {:<20} Origin", "Job", "Stages");
        println!("{}", "-".repeat(80));

        for job in &task.jobs {
            let stages = pipeline.resolve(job.start_stage.as_deref(), job.end_stage.as_deref())?;
            let range = match (stages.first(), stages.last()) {
                (Some(first), Some(last)) if stages.len() > 1 => {
                    format!("{}..{}", first.name(), last.name())
                }
                (Some(only), _) => only.name().to_string(),
                _ => String::new(),
            };
            println!(
                "{:<50} {:<20} {}",
                truncate(&job.key(), 49),
                range,
                style(job.origin_label()).dim()
            );
        }
        total += task.jobs.len();
    }

    println!("\n{} {} jobs", style("→").cyan(), total);
    Ok(ExitCode::SUCCESS)
}
