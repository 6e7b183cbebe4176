//! Extracting quality-of-result metrics from tool outputs.
//!
//! Two sources are supported:
//! - parse-pattern files, one `name;file_glob;regex[;default]` rule per line,
//!   where the first capture group of the last matching line is the value;
//! - `QOR: <name> = <number>` marker lines in the final stage's log, used
//!   when no parse patterns are configured.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::config_lines;
use super::error::ReportError;

/// One metric extraction rule.
#[derive(Debug, Clone)]
pub struct ParsePattern {
    pub name: String,
    /// File name glob, relative to the job's working directory.
    pub file_glob: String,
    regex: Regex,
    pub default: Option<f64>,
}

impl ParsePattern {
    pub fn new(
        name: impl Into<String>,
        file_glob: impl Into<String>,
        regex: &str,
        default: Option<f64>,
    ) -> Result<Self, regex::Error> {
        // Patterns match from the start of the line.
        let regex = Regex::new(&format!("^(?:{})", regex))?;
        Ok(Self {
            name: name.into(),
            file_glob: file_glob.into(),
            regex,
            default,
        })
    }

    /// Value of the first capture group on the last matching line.
    pub fn scan(&self, text: &str) -> Option<String> {
        let mut found = None;
        for line in text.lines() {
            let line = line.strip_prefix('#').unwrap_or(line);
            if let Some(caps) = self.regex.captures(line) {
                if let Some(m) = caps.get(1) {
                    found = Some(m.as_str().trim().to_string());
                }
            }
        }
        found
    }
}

/// Metric extractor for a task.
#[derive(Debug, Clone, Default)]
pub struct QorParser {
    patterns: Vec<ParsePattern>,
    source: Option<PathBuf>,
}

impl QorParser {
    pub fn new(patterns: Vec<ParsePattern>) -> Self {
        Self {
            patterns,
            source: None,
        }
    }

    /// Load a parse-pattern file.
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let text = std::fs::read_to_string(path).map_err(|e| ReportError::io(path, e))?;
        let mut parser = Self::parse(&text, path)?;
        parser.source = Some(path.to_path_buf());
        Ok(parser)
    }

    /// Parse pattern-file text. `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ReportError> {
        let mut patterns = Vec::new();
        let mut names = HashSet::new();

        for (line_no, line) in config_lines(text) {
            let parts: Vec<&str> = line.split(';').collect();
            if parts.len() != 3 && parts.len() != 4 {
                return Err(ReportError::malformed(
                    origin,
                    line_no,
                    format!("expected 'name;file;regex[;default]', got '{}'", line),
                ));
            }

            let name = parts[0].trim();
            if name.is_empty() {
                return Err(ReportError::malformed(origin, line_no, "empty metric name"));
            }
            if !names.insert(name.to_string()) {
                return Err(ReportError::malformed(
                    origin,
                    line_no,
                    format!("duplicate parse pattern name '{}'", name),
                ));
            }

            let default = match parts.get(3).map(|s| s.trim()) {
                None | Some("") => None,
                Some(s) => Some(s.parse::<f64>().map_err(|_| {
                    ReportError::malformed(
                        origin,
                        line_no,
                        format!("default value '{}' for '{}' is not a number", s, name),
                    )
                })?),
            };

            let pattern = ParsePattern::new(name, parts[1].trim(), parts[2], default).map_err(
                |source| ReportError::Regex {
                    path: origin.to_path_buf(),
                    line: line_no,
                    source,
                },
            )?;
            patterns.push(pattern);
        }

        Ok(Self::new(patterns))
    }

    pub fn patterns(&self) -> &[ParsePattern] {
        &self.patterns
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Metric names in declaration order. Empty in marker mode.
    pub fn metric_names(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.name.as_str()).collect()
    }

    /// Pull metrics out of a job's working directory.
    pub fn extract(&self, work_dir: &Path, final_log: Option<&Path>) -> BTreeMap<String, f64> {
        if self.patterns.is_empty() {
            return match final_log {
                Some(log) => match std::fs::read_to_string(log) {
                    Ok(text) => parse_markers(&text),
                    Err(e) => {
                        debug!("No QoR markers read from {}: {}", log.display(), e);
                        BTreeMap::new()
                    }
                },
                None => BTreeMap::new(),
            };
        }

        let mut metrics = BTreeMap::new();
        for pattern in &self.patterns {
            let value = match find_files(work_dir, &pattern.file_glob).as_slice() {
                [] => None,
                [file] => match std::fs::read_to_string(file) {
                    Ok(text) => pattern.scan(&text).and_then(|raw| match raw.parse::<f64>() {
                        Ok(v) => Some(v),
                        Err(_) => {
                            warn!(
                                "Metric '{}' in {}: '{}' is not a number",
                                pattern.name,
                                file.display(),
                                raw
                            );
                            None
                        }
                    }),
                    Err(e) => {
                        warn!("Cannot read {}: {}", file.display(), e);
                        None
                    }
                },
                many => {
                    warn!(
                        "File pattern '{}' for metric '{}' is ambiguous ({} files matched)",
                        pattern.file_glob,
                        pattern.name,
                        many.len()
                    );
                    None
                }
            };

            if let Some(v) = value.or(pattern.default).filter(|v| v.is_finite()) {
                metrics.insert(pattern.name.clone(), v);
            }
        }
        metrics
    }
}

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*QOR:\s*([A-Za-z0-9_.\-]+)\s*=\s*(\S+)\s*$").unwrap());

/// `QOR: name = value` lines; later lines override earlier ones.
pub fn parse_markers(text: &str) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    for line in text.lines() {
        if let Some(caps) = MARKER.captures(line) {
            match caps[2].parse::<f64>() {
                Ok(v) if v.is_finite() => {
                    metrics.insert(caps[1].to_string(), v);
                }
                _ => debug!("Ignoring non-numeric QoR marker: {}", line.trim()),
            }
        }
    }
    metrics
}

/// Translate a file-name glob (`*`, `?`) into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Files in `work_dir` matching `glob`. Wildcards apply to the last path
/// component only.
fn find_files(work_dir: &Path, glob: &str) -> Vec<PathBuf> {
    let glob_path = Path::new(glob);
    let (dir, file_glob) = match (glob_path.parent(), glob_path.file_name()) {
        (Some(parent), Some(name)) => (work_dir.join(parent), name.to_string_lossy().into_owned()),
        _ => (work_dir.to_path_buf(), glob.to_string()),
    };

    let re = match glob_to_regex(&file_glob) {
        Ok(re) => re,
        Err(e) => {
            warn!("Bad file pattern '{}': {}", glob, e);
            return Vec::new();
        }
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| re.is_match(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}
