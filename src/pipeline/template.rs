//! Command templates with `{name}` placeholders.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::TemplateError;
use crate::models::JobIdentity;

/// Variables every job provides. Script parameters may not reuse these names.
pub const BUILTIN_VARS: &[&str] = &[
    "circuit",
    "arch",
    "circuit_name",
    "arch_name",
    "work_dir",
    "stage",
];

/// A program plus its argument list, both of which may contain placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Expand the program and every argument.
    pub fn render(&self, vars: &TemplateVars) -> Result<(String, Vec<String>), TemplateError> {
        let program = render(&self.command, vars)?;
        let args = self
            .args
            .iter()
            .map(|arg| render(arg, vars))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((program, args))
    }
}

/// Values substituted into templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
}

impl TemplateVars {
    /// Built-in variables plus the job's script parameters.
    ///
    /// The `stage` variable is filled in per stage by [`TemplateVars::with_stage`].
    pub fn for_job(identity: &JobIdentity, work_dir: &Path) -> Self {
        let mut vars = BTreeMap::new();
        for (k, v) in &identity.params {
            vars.insert(k.clone(), v.clone());
        }
        vars.insert(
            "circuit".to_string(),
            identity.circuit.to_string_lossy().into_owned(),
        );
        vars.insert("arch".to_string(), identity.arch.to_string_lossy().into_owned());
        vars.insert("circuit_name".to_string(), identity.circuit_name());
        vars.insert("arch_name".to_string(), identity.arch_name());
        vars.insert(
            "work_dir".to_string(),
            work_dir.to_string_lossy().into_owned(),
        );
        Self { vars }
    }

    pub fn with_stage(&self, stage: &str) -> Self {
        let mut vars = self.clone();
        vars.insert("stage", stage);
        vars
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Expand `{name}` placeholders. `{{` and `}}` produce literal braces.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(TemplateError::Unterminated(template.to_string()));
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder(template.to_string()));
                }
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(TemplateError::Unbound(name.to_string())),
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Reject script parameters that would shadow a built-in variable.
pub fn check_param_names<'a>(
    params: impl IntoIterator<Item = &'a String>,
) -> Result<(), TemplateError> {
    for name in params {
        if BUILTIN_VARS.contains(&name.as_str()) {
            return Err(TemplateError::ReservedName(name.clone()));
        }
    }
    Ok(())
}
