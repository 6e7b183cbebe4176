//! Configuration management for cadflow using the prefer crate.
//!
//! Configuration is discovered with `prefer` (`cadflow.toml`, `cadflow.yaml`,
//! `cadflow.json` in the usual places) and parsed with serde. Everything has a
//! default, so running without a config file gives the built-in VTR-style
//! flow.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::CommandTemplate;

/// Default work root, relative to the current directory.
pub const DEFAULT_WORK_ROOT: &str = "runs";

/// Default frontend for stages marked `frontend = true`.
pub const DEFAULT_FRONTEND: &str = "odin";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse YAML config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What to do when two task records describe the same job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Refuse to start the batch.
    #[default]
    Reject,
    /// Keep the first record and warn about the rest.
    KeepFirst,
}

/// Batch-level knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Concurrent jobs. 0 means one per available core.
    pub max_parallel: usize,
    /// Extra attempts for jobs that fail on a flaky stage.
    pub retries: u32,
    /// Stages whose timeouts and tool failures are worth retrying.
    pub flaky_stages: Vec<String>,
    /// Wall-clock budget per job in seconds. 0 means no budget.
    pub job_timeout_secs: u64,
    /// Timeout for stages that don't set their own.
    pub default_stage_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when stopping a stage.
    pub kill_grace_ms: u64,
    pub on_duplicate: DuplicatePolicy,
    /// Directory holding the `runNNN` batch directories.
    pub work_root: String,
    /// Frontend bound to stages marked `frontend = true`.
    pub frontend: String,
    /// Relative metric change tolerated before a baseline comparison flags it.
    pub qor_tolerance: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            retries: 0,
            flaky_stages: Vec::new(),
            job_timeout_secs: 0,
            default_stage_timeout_secs: 24 * 60 * 60,
            kill_grace_ms: 2000,
            on_duplicate: DuplicatePolicy::Reject,
            work_root: DEFAULT_WORK_ROOT.to_string(),
            frontend: DEFAULT_FRONTEND.to_string(),
            qor_tolerance: 0.05,
        }
    }
}

impl FlowConfig {
    /// Number of workers to start.
    pub fn effective_parallelism(&self) -> usize {
        resolve_parallelism(self.max_parallel)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        match self.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Map a requested worker count to an actual one; 0 means "all cores".
pub fn resolve_parallelism(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Defaults to one more than the previous stage (the first stage is 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
    /// Run the selected frontend instead of `command`.
    #[serde(default)]
    pub frontend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments; may contain `{placeholders}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub fatal: bool,
    /// Append script parameters as `--name value` options.
    #[serde(default)]
    pub pass_params: bool,
}

fn default_true() -> bool {
    true
}

impl StageConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordinal: None,
            frontend: false,
            command: None,
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout_secs: None,
            fatal: true,
            pass_params: false,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flow: FlowConfig,
    /// Named frontends (`odin`, `yosys`, ...).
    pub frontends: BTreeMap<String, CommandTemplate>,
    pub stages: Vec<StageConfig>,
    /// Path of the file this config was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            frontends: default_frontends(),
            stages: default_stages(),
            source_path: None,
        }
    }
}

fn default_frontends() -> BTreeMap<String, CommandTemplate> {
    let mut frontends = BTreeMap::new();
    frontends.insert(
        "odin".to_string(),
        CommandTemplate::new("odin_II").with_args([
            "-a",
            "{arch}",
            "-V",
            "{circuit}",
            "-o",
            "{circuit_name}.odin.blif",
        ]),
    );
    frontends.insert(
        "yosys".to_string(),
        CommandTemplate::new("yosys").with_args([
            "-p",
            "read_verilog {circuit}; synth -flatten; write_blif {circuit_name}.odin.blif",
        ]),
    );
    frontends
}

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig {
            frontend: true,
            inputs: vec!["{circuit}".into()],
            outputs: vec!["{circuit_name}.odin.blif".into()],
            ..StageConfig::named("synth")
        },
        StageConfig {
            command: Some("abc".into()),
            args: vec![
                "-c".into(),
                "read {circuit_name}.odin.blif; strash; resyn2; if -K 6; write_blif {circuit_name}.abc.blif".into(),
            ],
            inputs: vec!["{circuit_name}.odin.blif".into()],
            outputs: vec!["{circuit_name}.abc.blif".into()],
            ..StageConfig::named("abc")
        },
        StageConfig {
            command: Some("vpr".into()),
            args: vec![
                "{arch}".into(),
                "{circuit_name}.abc.blif".into(),
                "--net_file".into(),
                "{circuit_name}.net".into(),
                "--pack".into(),
            ],
            inputs: vec!["{circuit_name}.abc.blif".into()],
            outputs: vec!["{circuit_name}.net".into()],
            ..StageConfig::named("pack")
        },
        StageConfig {
            command: Some("vpr".into()),
            args: vec![
                "{arch}".into(),
                "{circuit_name}.abc.blif".into(),
                "--net_file".into(),
                "{circuit_name}.net".into(),
                "--place_file".into(),
                "{circuit_name}.place".into(),
                "--place".into(),
            ],
            inputs: vec!["{circuit_name}.net".into()],
            outputs: vec!["{circuit_name}.place".into()],
            pass_params: true,
            ..StageConfig::named("place")
        },
        StageConfig {
            command: Some("vpr".into()),
            args: vec![
                "{arch}".into(),
                "{circuit_name}.abc.blif".into(),
                "--net_file".into(),
                "{circuit_name}.net".into(),
                "--place_file".into(),
                "{circuit_name}.place".into(),
                "--route_file".into(),
                "{circuit_name}.route".into(),
                "--route".into(),
            ],
            inputs: vec!["{circuit_name}.place".into()],
            outputs: vec!["{circuit_name}.route".into()],
            pass_params: true,
            ..StageConfig::named("route")
        },
        StageConfig {
            command: Some("vpr".into()),
            args: vec![
                "{arch}".into(),
                "{circuit_name}.abc.blif".into(),
                "--net_file".into(),
                "{circuit_name}.net".into(),
                "--place_file".into(),
                "{circuit_name}.place".into(),
                "--route_file".into(),
                "{circuit_name}.route".into(),
                "--analysis".into(),
            ],
            inputs: vec!["{circuit_name}.route".into()],
            fatal: false,
            ..StageConfig::named("sta")
        },
    ]
}

impl Config {
    /// Load configuration using prefer for discovery.
    ///
    /// Falls back to defaults when no config file is found. A config file
    /// that exists but doesn't parse is an error.
    pub async fn load() -> Result<Self, ConfigError> {
        match prefer::load("cadflow").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await,
                None => Ok(Self::default()),
            },
            Err(e) => {
                tracing::debug!("No cadflow config discovered: {}", e);
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file path.
    /// Format is chosen by extension: TOML, YAML, otherwise JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get the base directory for resolving relative paths.
    /// Returns the config file's parent directory if available.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Work root, resolved against the config file's directory or `cwd`.
    pub fn work_root(&self, cwd: &Path) -> PathBuf {
        let base = self.base_dir().unwrap_or_else(|| cwd.to_path_buf());
        resolve_path(&self.flow.work_root, &base)
    }
}

/// Resolve a path that may be relative.
/// - Absolute paths are returned as-is
/// - Paths starting with ~ are expanded
/// - Relative paths are resolved relative to `base_dir`
pub fn resolve_path(path_str: &str, base_dir: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(path_str);
    let path = Path::new(expanded.as_ref());

    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.flow.work_root, "runs");
        assert_eq!(config.flow.kill_grace(), Duration::from_millis(2000));
        assert_eq!(config.flow.job_timeout(), None);
        assert!(config.frontends.contains_key("odin"));
        assert!(config.frontends.contains_key("yosys"));
        assert_eq!(config.stages.len(), 6);
    }

    #[test]
    fn test_resolve_parallelism() {
        assert_eq!(resolve_parallelism(3), 3);
        assert!(resolve_parallelism(0) >= 1);
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/base");
        assert_eq!(resolve_path("/abs/x", base), PathBuf::from("/abs/x"));
        assert_eq!(resolve_path("rel/x", base), PathBuf::from("/base/rel/x"));
    }

    #[tokio::test]
    async fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[flow]
max_parallel = 4
retries = 2
flaky_stages = ["route"]
on_duplicate = "keep-first"

[[stages]]
name = "synth"
command = "sh"
args = ["-c", "echo {{circuit}}"]
outputs = ["out.txt"]

[[stages]]
name = "report"
command = "cat"
args = ["out.txt"]
fatal = false
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).await.unwrap();
        assert_eq!(config.flow.max_parallel, 4);
        assert_eq!(config.flow.retries, 2);
        assert_eq!(config.flow.on_duplicate, DuplicatePolicy::KeepFirst);
        // unspecified keys keep their defaults
        assert_eq!(config.flow.kill_grace_ms, 2000);
        assert_eq!(config.stages.len(), 2);
        assert!(config.stages[0].fatal);
        assert!(!config.stages[1].fatal);
        assert_eq!(config.stages[0].args[1], "echo {circuit}");
        assert_eq!(config.source_path.as_deref(), Some(file.path()));
    }

    #[tokio::test]
    async fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"flow": {{"job_timeout_secs": 30}}}}"#).unwrap();

        let config = Config::load_from_path(file.path()).await.unwrap();
        assert_eq!(config.flow.job_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.stages, Config::default().stages);
    }

    #[tokio::test]
    async fn test_load_invalid() {
        let mut file: NamedTempFile = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "[flow\nmax_parallel = ").unwrap();

        assert!(matches!(
            Config::load_from_path(file.path()).await,
            Err(ConfigError::Toml { .. })
        ));
    }
}
