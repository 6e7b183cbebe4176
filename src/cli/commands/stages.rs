//! The `stages` command.

use std::process::ExitCode;

use console::style;

use cadflow::config::Config;
use cadflow::pipeline::PipelineDefinition;

pub fn cmd_stages(config: &Config, frontend: Option<&str>) -> anyhow::Result<ExitCode> {
    let pipeline = PipelineDefinition::from_config(config, frontend)?;

    println!(
        "\n{} (frontend: {})",
        style("Pipeline").bold(),
        frontend.unwrap_or(&config.flow.frontend)
    );
    println!("{}", "-".repeat(72));
    println!(
        "{:<4} {:<10} {:<20} {:<10} {:<8} Tool",
        "#", "Stage", "Command", "Timeout", "Fatal"
    );
    println!("{}", "-".repeat(72));

    let mut missing = 0;
    for stage in pipeline.stages() {
        let program = &stage.command().command;
        let found = which::which(program).is_ok();
        if !found {
            missing += 1;
        }
        println!(
            "{:<4} {:<10} {:<20} {:<10} {:<8} {}",
            stage.ordinal(),
            stage.name(),
            program,
            format!("{}s", stage.timeout().as_secs()),
            if stage.is_fatal() { "yes" } else { "no" },
            if found {
                style("found").green().to_string()
            } else {
                style("not on PATH").yellow().to_string()
            }
        );
    }

    if missing > 0 {
        println!(
            "\n{} {} tool(s) not found on PATH",
            style("!").yellow(),
            missing
        );
    }
    Ok(ExitCode::SUCCESS)
}
