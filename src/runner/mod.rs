//! Stage execution: one external tool invocation per stage.

mod freshness;
mod process;

pub use freshness::outputs_up_to_date;
pub use process::{supervise, ProcessExit, ProcessSpec};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{StageOutcome, StageStatus};
use crate::pipeline::{Stage, TemplateVars};

/// Environment variable carrying the job key.
pub const ENV_JOB: &str = "CADFLOW_JOB";
/// Environment variable carrying the stage name.
pub const ENV_STAGE: &str = "CADFLOW_STAGE";
/// Environment variable carrying the job's working directory.
pub const ENV_WORK_DIR: &str = "CADFLOW_WORK_DIR";

/// Per-job context a stage runs in.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub job_key: &'a str,
    pub work_dir: &'a Path,
    /// Template variables, including `stage`.
    pub vars: &'a TemplateVars,
    pub params: &'a BTreeMap<String, String>,
}

/// Log file for a stage.
pub fn stage_log_path(work_dir: &Path, stage: &str) -> PathBuf {
    work_dir.join(format!("{}.log", stage))
}

/// Runs one stage and reports how it went.
///
/// Implementations never fail: every problem becomes a [`StageStatus`].
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run(
        &self,
        stage: &Stage,
        ctx: &StageContext<'_>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StageOutcome;
}

/// Executes stages as external processes.
#[derive(Debug, Clone)]
pub struct StageRunner {
    kill_grace: Duration,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000))
    }
}

impl StageRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

#[async_trait]
impl StageExecutor for StageRunner {
    async fn run(
        &self,
        stage: &Stage,
        ctx: &StageContext<'_>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let started = Instant::now();
        let failed = |status: StageStatus, detail: String| {
            StageOutcome::new(stage, status, started.elapsed()).with_detail(detail)
        };

        let inputs = match stage.resolve_inputs(ctx.vars, ctx.work_dir) {
            Ok(paths) => paths,
            Err(e) => return failed(StageStatus::ToolFailure, e.to_string()),
        };
        let missing: Vec<String> = inputs
            .iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            warn!(
                "[{}] {}: missing input {}",
                ctx.job_key,
                stage.name(),
                missing.join(", ")
            );
            return failed(
                StageStatus::MissingInput,
                format!("missing: {}", missing.join(", ")),
            );
        }

        let (program, args) = match stage.render_command(ctx.vars, ctx.params) {
            Ok(cmd) => cmd,
            Err(e) => return failed(StageStatus::ToolFailure, e.to_string()),
        };

        let log_path = stage_log_path(ctx.work_dir, stage.name());
        let log = match open_log(&log_path, &program, &args) {
            Ok(f) => f,
            Err(e) => {
                return failed(
                    StageStatus::ToolFailure,
                    format!("cannot create {}: {}", log_path.display(), e),
                )
            }
        };

        debug!(
            "[{}] {}: {} {}",
            ctx.job_key,
            stage.name(),
            program,
            args.join(" ")
        );

        let spec = ProcessSpec {
            program: &program,
            args: &args,
            cwd: ctx.work_dir,
            env: vec![
                (ENV_JOB, ctx.job_key.to_string()),
                (ENV_STAGE, stage.name().to_string()),
                (ENV_WORK_DIR, ctx.work_dir.to_string_lossy().into_owned()),
            ],
            log,
        };
        let exit = supervise(spec, timeout, cancel, self.kill_grace).await;
        let elapsed = started.elapsed();
        let outcome = |status| StageOutcome::new(stage, status, elapsed).with_log(&log_path);

        match exit {
            ProcessExit::Exited(status) if status.success() => {
                let outputs = match stage.resolve_outputs(ctx.vars, ctx.work_dir) {
                    Ok(paths) => paths,
                    Err(e) => {
                        return outcome(StageStatus::ToolFailure).with_detail(e.to_string())
                    }
                };
                let missing: Vec<String> = outputs
                    .iter()
                    .filter(|p| !p.exists())
                    .map(|p| p.display().to_string())
                    .collect();
                if missing.is_empty() {
                    outcome(StageStatus::Success).with_exit_code(status.code())
                } else {
                    warn!(
                        "[{}] {}: exited cleanly but did not produce {}",
                        ctx.job_key,
                        stage.name(),
                        missing.join(", ")
                    );
                    outcome(StageStatus::MissingOutput)
                        .with_exit_code(status.code())
                        .with_detail(format!("missing: {}", missing.join(", ")))
                }
            }
            ProcessExit::Exited(status) => {
                let detail = match status.code() {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by signal".to_string(),
                };
                outcome(StageStatus::ToolFailure)
                    .with_exit_code(status.code())
                    .with_detail(detail)
            }
            ProcessExit::TimedOut => outcome(StageStatus::Timeout)
                .with_detail(format!("exceeded {}s", timeout.as_secs_f64())),
            ProcessExit::Cancelled => outcome(StageStatus::Cancelled),
            ProcessExit::Failed(e) => outcome(StageStatus::ToolFailure)
                .with_detail(format!("failed to run '{}': {}", program, e)),
        }
    }
}

fn open_log(path: &Path, program: &str, args: &[String]) -> std::io::Result<File> {
    let mut file = File::create(path)?;
    writeln!(file, "$ {} {}", program, args.join(" "))?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobIdentity;
    use crate::pipeline::CommandTemplate;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        identity: JobIdentity,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let circuit = dir.path().join("adder.v");
            std::fs::write(&circuit, "module adder; endmodule\n").unwrap();
            let identity = JobIdentity::new(circuit, dir.path().join("k6.xml"));
            Self { dir, identity }
        }

        async fn run(&self, stage: &Stage, timeout: Duration) -> StageOutcome {
            let vars = TemplateVars::for_job(&self.identity, self.dir.path()).with_stage(stage.name());
            let ctx = StageContext {
                job_key: "k6/adder/common",
                work_dir: self.dir.path(),
                vars: &vars,
                params: &self.identity.params,
            };
            StageRunner::new(Duration::from_millis(200))
                .run(stage, &ctx, timeout, &CancellationToken::new())
                .await
        }
    }

    fn sh(name: &str, script: &str) -> Stage {
        Stage::new(name, 1, CommandTemplate::new("sh").with_args(["-c", script]))
    }

    #[tokio::test]
    async fn test_success_with_outputs() {
        let fx = Fixture::new();
        let stage = sh("synth", "cp {circuit} {circuit_name}.blif")
            .with_inputs(["{circuit}"])
            .with_outputs(["{circuit_name}.blif"]);

        let outcome = fx.run(&stage, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(fx.dir.path().join("adder.blif").exists());
        assert_eq!(outcome.log_path, Some(fx.dir.path().join("synth.log")));
    }

    #[tokio::test]
    async fn test_missing_input_does_not_spawn() {
        let fx = Fixture::new();
        let stage = sh("pack", "touch ran").with_inputs(["{circuit_name}.blif"]);

        let outcome = fx.run(&stage, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, StageStatus::MissingInput);
        assert!(!fx.dir.path().join("ran").exists());
        assert!(outcome.detail.unwrap().contains("adder.blif"));
    }

    #[tokio::test]
    async fn test_missing_output() {
        let fx = Fixture::new();
        let stage = sh("pack", "true").with_outputs(["{circuit_name}.net"]);

        let outcome = fx.run(&stage, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, StageStatus::MissingOutput);
    }

    #[tokio::test]
    async fn test_tool_failure() {
        let fx = Fixture::new();
        let outcome = fx.run(&sh("route", "exit 7"), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, StageStatus::ToolFailure);
        assert_eq!(outcome.exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_timeout() {
        let fx = Fixture::new();
        let started = Instant::now();
        let outcome = fx.run(&sh("place", "sleep 10"), Duration::from_millis(300)).await;
        assert_eq!(outcome.status, StageStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_environment_and_log() {
        let fx = Fixture::new();
        let stage = sh("sta", "echo \"$CADFLOW_JOB $CADFLOW_STAGE\"");
        let outcome = fx.run(&stage, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, StageStatus::Success);

        let log = std::fs::read_to_string(fx.dir.path().join("sta.log")).unwrap();
        assert!(log.starts_with("$ sh -c"));
        assert!(log.contains("k6/adder/common sta"));
    }

    #[tokio::test]
    async fn test_unbound_placeholder_is_tool_failure() {
        let fx = Fixture::new();
        let outcome = fx.run(&sh("synth", "echo {nope}"), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, StageStatus::ToolFailure);
        assert!(outcome.detail.unwrap().contains("nope"));
    }
}
