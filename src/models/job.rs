//! Job identity and specification.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::report::QorParser;

/// Slug used for jobs without script parameters.
pub const COMMON_SLUG: &str = "common";

/// Slugs longer than this are truncated and suffixed with a hash.
const MAX_SLUG_LEN: usize = 64;

/// What makes two jobs the same job: the circuit, the architecture and the
/// full parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity {
    pub circuit: PathBuf,
    pub arch: PathBuf,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl JobIdentity {
    pub fn new(circuit: impl Into<PathBuf>, arch: impl Into<PathBuf>) -> Self {
        Self {
            circuit: circuit.into(),
            arch: arch.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Circuit file name without its final extension.
    pub fn circuit_name(&self) -> String {
        file_stem(&self.circuit)
    }

    /// Architecture file name without its final extension.
    pub fn arch_name(&self) -> String {
        file_stem(&self.arch)
    }

    /// Directory-safe rendering of the parameter set.
    ///
    /// `common` when there are no parameters, otherwise `k=v` pairs joined
    /// with commas in key order. Long slugs keep a readable prefix and gain
    /// a short content hash so distinct parameter sets never share a slug.
    pub fn param_slug(&self) -> String {
        if self.params.is_empty() {
            return COMMON_SLUG.to_string();
        }

        let joined = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let slug = sanitize_component(&joined);

        if slug.len() <= MAX_SLUG_LEN {
            return slug;
        }

        let digest = hex::encode(Sha256::digest(joined.as_bytes()));
        let prefix: String = slug.chars().take(MAX_SLUG_LEN - 9).collect();
        format!("{}-{}", prefix, &digest[..8])
    }

    /// Stable key: `<arch_name>/<circuit_name>/<param_slug>`.
    ///
    /// Doubles as the job's directory path relative to the batch directory.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            sanitize_component(&self.arch_name()),
            sanitize_component(&self.circuit_name()),
            self.param_slug()
        )
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Where a job came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrigin {
    pub file: PathBuf,
    pub line: usize,
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// A unit of work as loaded from a task file.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Name of the task that produced this job.
    pub task: String,
    pub identity: JobIdentity,
    /// First stage to run. `None` means the pipeline's first stage.
    pub start_stage: Option<String>,
    /// Last stage to run. `None` means the pipeline's last stage.
    pub end_stage: Option<String>,
    /// Working directory. Assigned by the scheduler under the batch directory.
    pub work_dir: PathBuf,
    /// How QoR metrics are pulled out of this job's outputs.
    pub qor: Arc<QorParser>,
    pub origin: Option<RecordOrigin>,
}

impl JobSpec {
    pub fn new(task: impl Into<String>, identity: JobIdentity) -> Self {
        Self {
            task: task.into(),
            identity,
            start_stage: None,
            end_stage: None,
            work_dir: PathBuf::new(),
            qor: Arc::new(QorParser::default()),
            origin: None,
        }
    }

    pub fn with_stage_range(mut self, start: Option<&str>, end: Option<&str>) -> Self {
        self.start_stage = start.map(str::to_string);
        self.end_stage = end.map(str::to_string);
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn key(&self) -> String {
        self.identity.key()
    }

    /// Human-readable location of the record that declared this job.
    pub fn origin_label(&self) -> String {
        self.origin
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| self.task.clone())
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Replace characters that don't belong in a single path component.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '=' | ',' | '+' => c,
            _ => '_',
        })
        .collect();

    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}
