//! A single step of the flow.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::TemplateError;
use super::template::{render, CommandTemplate, TemplateVars};

/// Default per-stage timeout: one day.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Immutable description of one pipeline step.
///
/// Inputs and outputs are path templates, relative to the job's working
/// directory unless they render to an absolute path.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    name: String,
    ordinal: u32,
    command: CommandTemplate,
    inputs: Vec<String>,
    outputs: Vec<String>,
    timeout: Duration,
    fatal: bool,
    pass_params: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>, ordinal: u32, command: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            ordinal,
            command,
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            fatal: true,
            pass_params: false,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Failures of this stage degrade the job instead of ending it.
    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }

    /// Append the job's script parameters to the argument list as
    /// `--<name> <value>` pairs.
    pub fn passing_params(mut self) -> Self {
        self.pass_params = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn command(&self) -> &CommandTemplate {
        &self.command
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn passes_params(&self) -> bool {
        self.pass_params
    }

    /// Program and arguments for this stage.
    pub fn render_command(
        &self,
        vars: &TemplateVars,
        params: &BTreeMap<String, String>,
    ) -> Result<(String, Vec<String>), TemplateError> {
        let (program, mut args) = self.command.render(vars)?;
        if self.pass_params {
            for (k, v) in params {
                args.push(format!("--{}", k));
                args.push(v.clone());
            }
        }
        Ok((program, args))
    }

    pub fn resolve_inputs(
        &self,
        vars: &TemplateVars,
        work_dir: &Path,
    ) -> Result<Vec<PathBuf>, TemplateError> {
        resolve_paths(&self.inputs, vars, work_dir)
    }

    pub fn resolve_outputs(
        &self,
        vars: &TemplateVars,
        work_dir: &Path,
    ) -> Result<Vec<PathBuf>, TemplateError> {
        resolve_paths(&self.outputs, vars, work_dir)
    }

    /// Expand every template this stage owns, surfacing the first error.
    pub fn validate(&self, vars: &TemplateVars, work_dir: &Path) -> Result<(), TemplateError> {
        self.command.render(vars)?;
        self.resolve_inputs(vars, work_dir)?;
        self.resolve_outputs(vars, work_dir)?;
        Ok(())
    }
}

fn resolve_paths(
    templates: &[String],
    vars: &TemplateVars,
    work_dir: &Path,
) -> Result<Vec<PathBuf>, TemplateError> {
    templates
        .iter()
        .map(|t| render(t, vars).map(|p| work_dir.join(p)))
        .collect()
}
