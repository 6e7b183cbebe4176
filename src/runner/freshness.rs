//! Output freshness checks used when resuming.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when every output exists and none is older than any input.
///
/// A stage with no declared outputs is never considered up to date. Equal
/// timestamps count as fresh, since filesystem clocks are coarse.
pub fn outputs_up_to_date(inputs: &[PathBuf], outputs: &[PathBuf]) -> bool {
    if outputs.is_empty() {
        return false;
    }

    let mut oldest_output: Option<SystemTime> = None;
    for output in outputs {
        match modified(output) {
            Some(t) => oldest_output = Some(oldest_output.map_or(t, |o| o.min(t))),
            None => return false,
        }
    }

    let mut newest_input: Option<SystemTime> = None;
    for input in inputs {
        match modified(input) {
            Some(t) => newest_input = Some(newest_input.map_or(t, |n| n.max(t))),
            None => return false,
        }
    }

    match (oldest_output, newest_input) {
        (Some(out), Some(inp)) => out >= inp,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &Path, at: SystemTime) {
        let f = File::create(path).unwrap();
        f.set_modified(at).unwrap();
    }

    #[test]
    fn test_fresh_outputs() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let input = dir.path().join("in.blif");
        let output = dir.path().join("out.net");
        touch(&input, now - Duration::from_secs(60));
        touch(&output, now);

        assert!(outputs_up_to_date(&[input], &[output]));
    }

    #[test]
    fn test_stale_outputs() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let input = dir.path().join("in.blif");
        let output = dir.path().join("out.net");
        touch(&output, now - Duration::from_secs(60));
        touch(&input, now);

        assert!(!outputs_up_to_date(&[input], &[output]));
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.blif");
        let output = dir.path().join("out.net");
        touch(&input, SystemTime::now());

        assert!(!outputs_up_to_date(&[input.clone()], &[output.clone()]));
        assert!(!outputs_up_to_date(&[input], &[]));

        touch(&output, SystemTime::now());
        let gone = dir.path().join("gone.v");
        assert!(!outputs_up_to_date(&[gone], &[output]));
    }
}
