//! On-disk layout of batches.
//!
//! ```text
//! <work_root>/
//!   run001/
//!     batch_report.json
//!     parse_results.txt
//!     <arch>/<circuit>/<param_slug>/
//!       <stage>.log
//!       job_result.json
//!   run002/
//! ```

use std::io;
use std::path::{Path, PathBuf};

const RUN_PREFIX: &str = "run";

/// Name of the batch directory with the given number: `run001`, `run002`, ...
pub fn run_dir_name(number: u32) -> String {
    format!("{}{:03}", RUN_PREFIX, number)
}

/// Parse the number out of a `runNNN` directory name.
pub fn run_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(RUN_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Highest-numbered existing batch directory under `work_root`.
pub fn latest_run_dir(work_root: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut latest: Option<(u32, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = run_number(&entry.file_name().to_string_lossy()) {
            if latest.as_ref().map_or(true, |(best, _)| n > *best) {
                latest = Some((n, entry.path()));
            }
        }
    }
    Ok(latest.map(|(_, path)| path))
}

/// Create and return the next batch directory under `work_root`.
///
/// Uses `create_dir` so two concurrent invocations never share a directory.
pub fn create_next_run_dir(work_root: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(work_root)?;
    let mut next = match latest_run_dir(work_root)? {
        Some(path) => path
            .file_name()
            .and_then(|n| run_number(&n.to_string_lossy()))
            .map_or(1, |n| n + 1),
        None => 1,
    };

    loop {
        let candidate = work_root.join(run_dir_name(next));
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => next += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Batch directory to use: the latest one when resuming (if any), otherwise
/// a fresh one.
pub fn select_run_dir(work_root: &Path, resume: bool) -> io::Result<PathBuf> {
    if resume {
        if let Some(latest) = latest_run_dir(work_root)? {
            return Ok(latest);
        }
    }
    create_next_run_dir(work_root)
}

/// Working directory of a job inside a batch directory.
pub fn job_dir(batch_dir: &Path, job_key: &str) -> PathBuf {
    batch_dir.join(job_key)
}
