//! Loading task files into job specifications.
//!
//! A task file either lists circuits, architectures and parameter sets
//! whose cross product becomes the jobs, or spells jobs out one per line:
//!
//! ```text
//! circuits_dir=benchmarks/verilog
//! archs_dir=arch/timing
//! circuit_list_add=ch_intrinsics.v
//! circuit_list_add=diffeq1.v
//! arch_list_add=k6_N10_mem32K_40nm.xml
//! script_params_list_add=
//! script_params_list_add=seed=2
//! end_stage=route
//! parse_file=parse/vpr_standard.txt
//!
//! job circuit=extra/stereovision3.v arch=k6_N10_40nm.xml start=pack seed=5
//! ```

mod parser;

pub use parser::{parse_line, parse_params, TaskLine};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::resolve_path;
use crate::models::{JobIdentity, JobSpec, RecordOrigin};
use crate::pipeline::{PipelineDefinition, PipelineError};
use crate::report::{config_lines, PassRequirements, QorParser, ReportError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("cannot read task file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{path}:{line}: {source}")]
    Stage {
        path: PathBuf,
        line: usize,
        #[source]
        source: PipelineError,
    },

    #[error("{path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: ReportError,
    },

    #[error("{path}: task defines no jobs")]
    Empty { path: PathBuf },
}

/// A loaded task file.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub name: String,
    pub path: PathBuf,
    pub jobs: Vec<JobSpec>,
    pub parse_file: Option<PathBuf>,
    pub pass_requirements: Option<(PathBuf, PassRequirements)>,
}

/// A setting value with the line it came from.
#[derive(Debug, Clone)]
struct Located {
    line: usize,
    value: String,
}

#[derive(Debug, Default)]
struct Settings {
    circuits_dir: Option<Located>,
    archs_dir: Option<Located>,
    circuits: Vec<Located>,
    archs: Vec<Located>,
    param_sets: Vec<Located>,
    start_stage: Option<Located>,
    end_stage: Option<Located>,
    parse_file: Option<Located>,
    pass_requirements_file: Option<Located>,
}

/// Task name for a task file: its stem, or `<task>` for a `config.txt`
/// inside `<task>/` or `<task>/config/`.
pub fn task_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string());
    if stem != "config" {
        return stem;
    }

    let mut dir = path.parent();
    if dir.and_then(|p| p.file_name()).is_some_and(|n| n == "config") {
        dir = dir.and_then(|p| p.parent());
    }
    dir.and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(stem)
}

/// Accept a task file, or a task directory holding `config/config.txt` or
/// `config.txt`.
pub fn resolve_task_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        for candidate in [path.join("config").join("config.txt"), path.join("config.txt")] {
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    path.to_path_buf()
}

/// Absolute form of `path` without touching the filesystem.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Load one task file and expand it into job specs.
pub fn load_task(path: &Path, pipeline: &PipelineDefinition) -> Result<TaskFile, TaskError> {
    let path = absolute(&resolve_task_path(path));
    let text = std::fs::read_to_string(&path).map_err(|source| TaskError::Io {
        path: path.clone(),
        source,
    })?;
    parse_task(&text, &path, pipeline)
}

/// Load several task files. Jobs keep file order, then line order.
pub fn load_tasks(paths: &[PathBuf], pipeline: &PipelineDefinition) -> Result<Vec<TaskFile>, TaskError> {
    paths.iter().map(|p| load_task(p, pipeline)).collect()
}

/// Parse task-file text as if it were read from `path`.
pub fn parse_task(text: &str, path: &Path, pipeline: &PipelineDefinition) -> Result<TaskFile, TaskError> {
    let syntax = |line: usize, message: String| TaskError::Syntax {
        path: path.to_path_buf(),
        line,
        message,
    };
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = task_name(path);

    let mut settings = Settings::default();
    let mut records: Vec<(usize, BTreeMap<String, String>)> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let parsed = parse_line(raw).map_err(|msg| syntax(line, msg))?;
        let Some(parsed) = parsed else { continue };

        match parsed {
            TaskLine::Job { fields } => records.push((line, fields)),
            TaskLine::Setting { key, value } => {
                let located = Located { line, value };
                match key.as_str() {
                    "circuits_dir" => settings.circuits_dir = Some(located),
                    "archs_dir" => settings.archs_dir = Some(located),
                    "circuit_list_add" => settings.circuits.push(located),
                    "arch_list_add" => settings.archs.push(located),
                    "script_params_list_add" => settings.param_sets.push(located),
                    "start_stage" => settings.start_stage = Some(located),
                    "end_stage" => settings.end_stage = Some(located),
                    "parse_file" => settings.parse_file = Some(located),
                    "pass_requirements_file" => settings.pass_requirements_file = Some(located),
                    other => return Err(syntax(line, format!("unknown setting '{}'", other))),
                }
            }
        }
    }

    let circuits_dir = settings
        .circuits_dir
        .as_ref()
        .map(|d| resolve_path(&d.value, &base_dir));
    let archs_dir = settings
        .archs_dir
        .as_ref()
        .map(|d| resolve_path(&d.value, &base_dir));
    let circuit_path = |value: &str| resolve_path(value, circuits_dir.as_deref().unwrap_or(&base_dir));
    let arch_path = |value: &str| resolve_path(value, archs_dir.as_deref().unwrap_or(&base_dir));

    let qor = match &settings.parse_file {
        Some(p) => {
            let file = resolve_path(&p.value, &base_dir);
            let parser = QorParser::load(&file).map_err(|source| TaskError::Report {
                path: path.to_path_buf(),
                source,
            })?;
            Arc::new(parser)
        }
        None => Arc::new(QorParser::default()),
    };

    let pass_requirements = match &settings.pass_requirements_file {
        Some(p) => {
            let file = resolve_path(&p.value, &base_dir);
            let reqs = PassRequirements::load(&file).map_err(|source| TaskError::Report {
                path: path.to_path_buf(),
                source,
            })?;
            Some((file, reqs))
        }
        None => None,
    };

    let check_range = |line: usize, start: Option<&str>, end: Option<&str>| {
        pipeline
            .resolve(start, end)
            .map(|_| ())
            .map_err(|source| TaskError::Stage {
                path: path.to_path_buf(),
                line,
                source,
            })
    };

    let origin = |line: usize| RecordOrigin {
        file: path.to_path_buf(),
        line,
    };

    let mut jobs = Vec::new();

    // Cross product: architectures x circuits x parameter sets.
    match (settings.circuits.is_empty(), settings.archs.is_empty()) {
        (false, true) => {
            return Err(syntax(
                settings.circuits[0].line,
                "circuits listed but no arch_list_add".to_string(),
            ))
        }
        (true, false) => {
            return Err(syntax(
                settings.archs[0].line,
                "architectures listed but no circuit_list_add".to_string(),
            ))
        }
        _ => {}
    }

    let start = settings.start_stage.as_ref().map(|s| s.value.as_str());
    let end = settings.end_stage.as_ref().map(|s| s.value.as_str());
    if start.is_some() || end.is_some() {
        let line = [&settings.start_stage, &settings.end_stage]
            .iter()
            .filter_map(|s| s.as_ref().map(|l| l.line))
            .max()
            .unwrap_or(1);
        check_range(line, start, end)?;
    }

    let mut param_sets = Vec::with_capacity(settings.param_sets.len().max(1));
    for set in &settings.param_sets {
        param_sets.push((set.line, parse_params(&set.value).map_err(|m| syntax(set.line, m))?));
    }
    if param_sets.is_empty() {
        param_sets.push((0, BTreeMap::new()));
    }

    for arch in &settings.archs {
        for circuit in &settings.circuits {
            for (params_line, params) in &param_sets {
                let identity = JobIdentity {
                    circuit: circuit_path(&circuit.value),
                    arch: arch_path(&arch.value),
                    params: params.clone(),
                };
                let mut spec = JobSpec::new(&name, identity).with_stage_range(start, end);
                spec.qor = qor.clone();
                spec.origin = Some(origin((*params_line).max(circuit.line)));
                jobs.push(spec);
            }
        }
    }

    // Explicit job records.
    for (line, mut fields) in records {
        let circuit = fields
            .remove("circuit")
            .ok_or_else(|| syntax(line, "job record needs circuit=<path>".to_string()))?;
        let arch = fields
            .remove("arch")
            .ok_or_else(|| syntax(line, "job record needs arch=<path>".to_string()))?;
        let rec_start = fields.remove("start");
        let rec_end = fields.remove("end");
        let start = rec_start.as_deref().or(start);
        let end = rec_end.as_deref().or(end);
        check_range(line, start, end)?;

        let identity = JobIdentity {
            circuit: circuit_path(&circuit),
            arch: arch_path(&arch),
            params: fields,
        };
        let mut spec = JobSpec::new(&name, identity).with_stage_range(start, end);
        spec.qor = qor.clone();
        spec.origin = Some(origin(line));
        jobs.push(spec);
    }

    if jobs.is_empty() {
        return Err(TaskError::Empty {
            path: path.to_path_buf(),
        });
    }

    debug!("Task {} ({}): {} jobs", name, path.display(), jobs.len());

    Ok(TaskFile {
        name,
        path: path.to_path_buf(),
        jobs,
        parse_file: settings
            .parse_file
            .as_ref()
            .map(|p| resolve_path(&p.value, &base_dir)),
        pass_requirements,
    })
}

/// Task paths listed one per line in `path`. Blank lines and `#` comments
/// are ignored; relative entries resolve against the list file's directory.
pub fn load_list_file(path: &Path) -> Result<Vec<PathBuf>, TaskError> {
    let text = std::fs::read_to_string(path).map_err(|source| TaskError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(config_lines(&text)
        .map(|(_, line)| resolve_path(line, base_dir))
        .collect())
}

/// Force every job onto the same stage range.
pub fn apply_stage_override(
    jobs: &mut [JobSpec],
    start: Option<&str>,
    end: Option<&str>,
) {
    for job in jobs {
        if let Some(s) = start {
            job.start_stage = Some(s.to_string());
        }
        if let Some(e) = end {
            job.end_stage = Some(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CommandTemplate, Stage};
    use tempfile::TempDir;

    fn pipeline() -> PipelineDefinition {
        let names = ["synth", "abc", "pack", "place", "route"];
        PipelineDefinition::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| Stage::new(*n, i as u32 + 1, CommandTemplate::new("true")))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_list_file() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("nightly.lst");
        std::fs::write(&list, "# nightly suite\n\nregression/basic\n/opt/tasks/smoke\n").unwrap();

        let paths = load_list_file(&list).unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("regression/basic"), PathBuf::from("/opt/tasks/smoke")]
        );
        assert!(matches!(
            load_list_file(&dir.path().join("missing.lst")),
            Err(TaskError::Io { .. })
        ));
    }

    #[test]
    fn test_cross_product() {
        let text = "\
circuits_dir=/bench
archs_dir=/arch
circuit_list_add=a.v
circuit_list_add=b.v
arch_list_add=k6.xml
arch_list_add=k4.xml
script_params_list_add=
script_params_list_add=seed=2
end_stage=route
";
        let task = parse_task(text, Path::new("/tasks/basic.txt"), &pipeline()).unwrap();
        assert_eq!(task.name, "basic");
        assert_eq!(task.jobs.len(), 8);

        let first = &task.jobs[0];
        assert_eq!(first.identity.arch, PathBuf::from("/arch/k6.xml"));
        assert_eq!(first.identity.circuit, PathBuf::from("/bench/a.v"));
        assert!(first.identity.params.is_empty());
        assert_eq!(first.end_stage.as_deref(), Some("route"));
        assert_eq!(task.jobs[1].identity.params["seed"], "2");
        assert_eq!(task.jobs[7].key(), "k4/b/seed=2");
    }

    #[test]
    fn test_explicit_records() {
        let text = "job circuit=c/x.v arch=/a/k6.xml start=pack seed=1\n";
        let task = parse_task(text, Path::new("/tasks/t.txt"), &pipeline()).unwrap();
        let job = &task.jobs[0];
        assert_eq!(job.identity.circuit, PathBuf::from("/tasks/c/x.v"));
        assert_eq!(job.start_stage.as_deref(), Some("pack"));
        assert_eq!(job.identity.params.len(), 1);
        assert_eq!(job.origin_label(), "/tasks/t.txt:1");
    }

    #[test]
    fn test_errors_name_file_and_line() {
        let p = pipeline();
        let err = parse_task("circuit_list_add=a.v\nbogus=1\n", Path::new("/t/x.txt"), &p).unwrap_err();
        assert_eq!(err.to_string(), "/t/x.txt:2: unknown setting 'bogus'");

        let err = parse_task("job arch=k.xml\n", Path::new("/t/x.txt"), &p).unwrap_err();
        assert!(err.to_string().starts_with("/t/x.txt:1:"));

        let err = parse_task(
            "job circuit=a.v arch=k.xml end=lec\n",
            Path::new("/t/x.txt"),
            &p,
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::Stage { line: 1, .. }));

        let err = parse_task(
            "circuit_list_add=a.v\narch_list_add=k.xml\nstart_stage=route\nend_stage=synth\n",
            Path::new("/t/x.txt"),
            &p,
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::Stage { line: 4, .. }));

        assert!(matches!(
            parse_task("# nothing\n", Path::new("/t/x.txt"), &p),
            Err(TaskError::Empty { .. })
        ));
        assert!(parse_task("circuit_list_add=a.v\n", Path::new("/t/x.txt"), &p).is_err());
    }

    #[test]
    fn test_task_name() {
        assert_eq!(task_name(Path::new("/t/regression/config/config.txt")), "regression");
        assert_eq!(task_name(Path::new("/t/smoke/config.txt")), "smoke");
        assert_eq!(task_name(Path::new("/t/smoke.txt")), "smoke");
    }

    #[test]
    fn test_load_task_directory_with_parse_file() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("basic_flow/config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("qor.txt"), "wl;vpr.out;Total wirelength: (\\d+)\n").unwrap();
        std::fs::write(
            config_dir.join("config.txt"),
            "circuit_list_add=a.v\narch_list_add=k6.xml\nparse_file=qor.txt\n",
        )
        .unwrap();

        let task = load_task(&dir.path().join("basic_flow"), &pipeline()).unwrap();
        assert_eq!(task.name, "basic_flow");
        assert_eq!(task.jobs[0].qor.metric_names(), vec!["wl"]);
        assert_eq!(task.parse_file, Some(config_dir.join("qor.txt")));
    }

    #[test]
    fn test_stage_override() {
        let mut jobs = vec![JobSpec::new("t", JobIdentity::new("a.v", "k.xml"))
            .with_stage_range(Some("synth"), Some("pack"))];
        apply_stage_override(&mut jobs, None, Some("route"));
        assert_eq!(jobs[0].start_stage.as_deref(), Some("synth"));
        assert_eq!(jobs[0].end_stage.as_deref(), Some("route"));
    }
}
