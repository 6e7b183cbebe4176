//! Ordered stage pipelines and stage-range resolution.

mod error;
mod stage;
mod template;

pub use error::{PipelineError, TemplateError};
pub use stage::{Stage, DEFAULT_STAGE_TIMEOUT};
pub use template::{check_param_names, render, CommandTemplate, TemplateVars, BUILTIN_VARS};

use std::collections::HashSet;
use std::time::Duration;

use crate::config::Config;

/// An ordered, validated list of stages.
///
/// Names are unique and ordinals strictly increase, so stage order, ordinal
/// order and list order agree.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    stages: Vec<Stage>,
}

impl PipelineDefinition {
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut seen = HashSet::new();
        let mut previous: Option<u32> = None;
        for stage in &stages {
            if !seen.insert(stage.name()) {
                return Err(PipelineError::DuplicateStage(stage.name().to_string()));
            }
            if let Some(prev) = previous {
                if stage.ordinal() <= prev {
                    return Err(PipelineError::OrdinalOrder {
                        stage: stage.name().to_string(),
                        ordinal: stage.ordinal(),
                        previous: prev,
                    });
                }
            }
            previous = Some(stage.ordinal());
        }

        Ok(Self { stages })
    }

    /// Build the pipeline described by `config`, with frontend stages bound
    /// to `frontend` (or the configured default).
    pub fn from_config(config: &Config, frontend: Option<&str>) -> Result<Self, PipelineError> {
        let frontend_name = frontend.unwrap_or(&config.flow.frontend);
        let default_timeout = match config.flow.default_stage_timeout_secs {
            0 => DEFAULT_STAGE_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        let mut stages = Vec::with_capacity(config.stages.len());
        let mut next_ordinal = 1;
        for sc in &config.stages {
            let command = if sc.frontend {
                let fe = config.frontends.get(frontend_name).ok_or_else(|| {
                    PipelineError::UnknownFrontend {
                        name: frontend_name.to_string(),
                        available: config
                            .frontends
                            .keys()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", "),
                    }
                })?;
                let mut args = fe.args.clone();
                args.extend(sc.args.iter().cloned());
                CommandTemplate {
                    command: fe.command.clone(),
                    args,
                }
            } else {
                let command = sc
                    .command
                    .clone()
                    .ok_or_else(|| PipelineError::MissingCommand(sc.name.clone()))?;
                CommandTemplate {
                    command,
                    args: sc.args.clone(),
                }
            };

            let ordinal = sc.ordinal.unwrap_or(next_ordinal);
            next_ordinal = ordinal + 1;

            let timeout = match sc.timeout_secs {
                Some(secs) if secs > 0 => Duration::from_secs(secs),
                _ => default_timeout,
            };

            let mut stage = Stage::new(&sc.name, ordinal, command)
                .with_inputs(sc.inputs.iter().cloned())
                .with_outputs(sc.outputs.iter().cloned())
                .with_timeout(timeout);
            if !sc.fatal {
                stage = stage.non_fatal();
            }
            if sc.pass_params {
                stage = stage.passing_params();
            }
            stages.push(stage);
        }

        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn first(&self) -> &Stage {
        &self.stages[0]
    }

    pub fn last(&self) -> &Stage {
        &self.stages[self.stages.len() - 1]
    }

    fn position(&self, name: &str) -> Result<usize, PipelineError> {
        self.stages
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// The contiguous stages from `start` through `end`, inclusive.
    ///
    /// Missing bounds default to the first and last stage.
    pub fn resolve(&self, start: Option<&str>, end: Option<&str>) -> Result<&[Stage], PipelineError> {
        let from = match start {
            Some(name) => self.position(name)?,
            None => 0,
        };
        let to = match end {
            Some(name) => self.position(name)?,
            None => self.stages.len() - 1,
        };

        if from > to {
            return Err(PipelineError::InvalidRange {
                start: self.stages[from].name().to_string(),
                end: self.stages[to].name().to_string(),
            });
        }

        Ok(&self.stages[from..=to])
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    fn pipeline(names: &[&str]) -> PipelineDefinition {
        let stages = names
            .iter()
            .enumerate()
            .map(|(i, n)| Stage::new(*n, i as u32 + 1, CommandTemplate::new("true")))
            .collect();
        PipelineDefinition::new(stages).unwrap()
    }

    #[test]
    fn test_resolve_defaults_to_whole_pipeline() {
        let p = pipeline(&["synth", "pack", "place", "route"]);
        let names: Vec<_> = p.resolve(None, None).unwrap().iter().map(Stage::name).collect();
        assert_eq!(names, vec!["synth", "pack", "place", "route"]);
    }

    #[test]
    fn test_resolve_subrange() {
        let p = pipeline(&["synth", "pack", "place", "route"]);
        let names: Vec<_> = p
            .resolve(Some("pack"), Some("place"))
            .unwrap()
            .iter()
            .map(Stage::name)
            .collect();
        assert_eq!(names, vec!["pack", "place"]);

        let single = p.resolve(Some("route"), Some("route")).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_resolve_rejects_backwards_range() {
        let p = pipeline(&["synth", "pack", "place", "route"]);
        assert!(matches!(
            p.resolve(Some("route"), Some("synth")),
            Err(PipelineError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_resolve_unknown_stage() {
        let p = pipeline(&["synth", "route"]);
        assert!(matches!(
            p.resolve(Some("lec"), None),
            Err(PipelineError::UnknownStage(name)) if name == "lec"
        ));
    }

    #[test]
    fn test_new_validates() {
        assert!(matches!(
            PipelineDefinition::new(vec![]),
            Err(PipelineError::Empty)
        ));

        let dup = vec![
            Stage::new("a", 1, CommandTemplate::new("true")),
            Stage::new("a", 2, CommandTemplate::new("true")),
        ];
        assert!(matches!(
            PipelineDefinition::new(dup),
            Err(PipelineError::DuplicateStage(_))
        ));

        let unordered = vec![
            Stage::new("a", 2, CommandTemplate::new("true")),
            Stage::new("b", 2, CommandTemplate::new("true")),
        ];
        assert!(matches!(
            PipelineDefinition::new(unordered),
            Err(PipelineError::OrdinalOrder { .. })
        ));
    }

    #[test]
    fn test_default_config_pipeline() {
        let config = Config::default();
        let p = PipelineDefinition::from_config(&config, None).unwrap();
        assert_eq!(p.names(), vec!["synth", "abc", "pack", "place", "route", "sta"]);
        assert!(!p.stage("sta").unwrap().is_fatal());
        assert_eq!(p.first().command().command, "odin_II");

        let yosys = PipelineDefinition::from_config(&config, Some("yosys")).unwrap();
        assert_eq!(yosys.first().command().command, "yosys");
    }

    #[test]
    fn test_unknown_frontend() {
        let config = Config::default();
        assert!(matches!(
            PipelineDefinition::from_config(&config, Some("quartus")),
            Err(PipelineError::UnknownFrontend { .. })
        ));
    }

    #[test]
    fn test_config_ordinals_and_timeouts() {
        let mut config = Config::default();
        config.stages = vec![
            StageConfig {
                command: Some("a".into()),
                ..StageConfig::named("one")
            },
            StageConfig {
                command: Some("b".into()),
                ordinal: Some(10),
                timeout_secs: Some(5),
                ..StageConfig::named("two")
            },
            StageConfig {
                command: Some("c".into()),
                ..StageConfig::named("three")
            },
        ];
        let p = PipelineDefinition::from_config(&config, None).unwrap();
        let ordinals: Vec<_> = p.stages().iter().map(Stage::ordinal).collect();
        assert_eq!(ordinals, vec![1, 10, 11]);
        assert_eq!(p.stage("two").unwrap().timeout(), Duration::from_secs(5));

        config.stages.push(StageConfig::named("nocmd"));
        assert!(matches!(
            PipelineDefinition::from_config(&config, None),
            Err(PipelineError::MissingCommand(_))
        ));
    }
}
