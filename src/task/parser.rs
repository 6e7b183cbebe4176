//! Line-level parsing of task files.

use std::collections::BTreeMap;

/// One meaningful line of a task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLine {
    /// `key=value`
    Setting { key: String, value: String },
    /// `job circuit=... arch=... [start=...] [end=...] [param=value ...]`
    Job { fields: BTreeMap<String, String> },
}

/// Strip a trailing `#` comment and surrounding whitespace.
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => line[..pos].trim(),
        None => line.trim(),
    }
}

/// Parse one line. Blank and comment-only lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<TaskLine>, String> {
    let line = strip_comment(line);
    if line.is_empty() {
        return Ok(None);
    }

    let first = line.split_whitespace().next().unwrap_or_default();
    if first == "job" {
        let rest = line[first.len()..].trim();
        let fields = parse_params(rest)?;
        return Ok(Some(TaskLine::Job { fields }));
    }

    match line.split_once('=') {
        Some((key, value)) => {
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(format!("invalid setting name '{}'", key));
            }
            Ok(Some(TaskLine::Setting {
                key: key.to_string(),
                value: value.trim().to_string(),
            }))
        }
        None => Err(format!("expected 'key=value' or a 'job' record, got '{}'", line)),
    }
}

/// Parse whitespace-separated `key=value` pairs. Keys must be unique.
pub fn parse_params(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut params = BTreeMap::new();
    for token in text.split_whitespace() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| format!("expected 'key=value', got '{}'", token))?;
        if key.is_empty() {
            return Err(format!("missing parameter name in '{}'", token));
        }
        if params.insert(key.to_string(), value.to_string()).is_some() {
            return Err(format!("parameter '{}' given more than once", key));
        }
    }
    Ok(params)
}
