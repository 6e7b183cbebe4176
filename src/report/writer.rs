//! Report and per-job record files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::error::ReportError;
use super::{BatchReport, SCHEMA_VERSION};
use crate::models::JobResult;

/// Batch report file name inside the batch directory.
pub const REPORT_FILE: &str = "batch_report.json";
/// Tab-separated metrics table inside the batch directory.
pub const TSV_FILE: &str = "parse_results.txt";
/// Per-job result record inside each job directory.
pub const JOB_RECORD_FILE: &str = "job_result.json";

/// Write to a sibling temp file, then rename into place.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ReportError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(|e| ReportError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ReportError::io(path, e))
}

fn to_json(value: &impl serde::Serialize, path: &Path) -> Result<Vec<u8>, ReportError> {
    let mut json = serde_json::to_vec_pretty(value).map_err(|source| ReportError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    json.push(b'\n');
    Ok(json)
}

impl BatchReport {
    /// Read a report written by [`write_report`].
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let text = std::fs::read_to_string(path).map_err(|e| ReportError::io(path, e))?;
        let report: BatchReport = serde_json::from_str(&text).map_err(|source| ReportError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if report.schema_version != SCHEMA_VERSION {
            return Err(ReportError::Schema {
                path: path.to_path_buf(),
                found: report.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(report)
    }

    /// Write this report alone to `path`, without the TSV table.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        write_atomic(path, &to_json(self, path)?)
    }
}

/// Write `batch_report.json` and `parse_results.txt` into `batch_dir`.
///
/// Returns the path of the JSON report.
pub fn write_report(batch_dir: &Path, report: &BatchReport) -> Result<PathBuf, ReportError> {
    let path = batch_dir.join(REPORT_FILE);
    write_atomic(&path, &to_json(report, &path)?)?;
    write_atomic(&batch_dir.join(TSV_FILE), render_tsv(report).as_bytes())?;
    Ok(path)
}

/// Metrics table, one row per job, one column per metric seen in the batch.
pub fn render_tsv(report: &BatchReport) -> String {
    let metric_names: BTreeSet<&str> = report
        .jobs
        .values()
        .flat_map(|j| j.metrics.keys().map(String::as_str))
        .collect();

    let mut out = String::from("job\tarch\tcircuit\tparams\tstatus");
    for name in &metric_names {
        out.push('\t');
        out.push_str(name);
    }
    out.push('\n');

    for (key, job) in &report.jobs {
        let params = job
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}",
            key, job.arch, job.circuit, params, job.status
        ));
        for name in &metric_names {
            out.push('\t');
            if let Some(v) = job.metrics.get(*name) {
                out.push_str(&v.to_string());
            }
        }
        out.push('\n');
    }
    out
}

/// Write `job_result.json` into the job's working directory.
pub fn write_job_record(result: &JobResult) -> Result<PathBuf, ReportError> {
    let path = result.work_dir.join(JOB_RECORD_FILE);
    write_atomic(&path, &to_json(result, &path)?)?;
    Ok(path)
}

pub fn load_job_record(path: &Path) -> Result<JobResult, ReportError> {
    let text = std::fs::read_to_string(path).map_err(|e| ReportError::io(path, e))?;
    serde_json::from_str(&text).map_err(|source| ReportError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobIdentity, JobStatus};
    use crate::report::Aggregator;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn result(dir: &Path, circuit: &str, metrics: &[(&str, f64)]) -> JobResult {
        let identity = JobIdentity::new(format!("{}.v", circuit), "k6.xml").with_param("seed", "1");
        JobResult {
            key: identity.key(),
            task: "t".into(),
            identity,
            work_dir: dir.to_path_buf(),
            status: JobStatus::Success,
            degraded: false,
            attempts: 1,
            stages: Vec::new(),
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
            error: None,
        }
    }

    #[test]
    fn test_report_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let report = Aggregator::new().aggregate(&[
            result(dir.path(), "a", &[("wl", 0.1 + 0.2)]),
            result(dir.path(), "b", &[("wl", 1e-7)]),
        ]);

        let path = write_report(dir.path(), &report).unwrap();
        assert_eq!(path, dir.path().join(REPORT_FILE));
        assert_eq!(BatchReport::load(&path).unwrap(), report);
        assert!(!dir.path().join("batch_report.tmp").exists());
    }

    #[test]
    fn test_load_rejects_other_schema() {
        let dir = TempDir::new().unwrap();
        let mut report = BatchReport::from_jobs(BTreeMap::new(), false);
        report.schema_version = 99;
        let path = dir.path().join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_string(&report).unwrap()).unwrap();

        assert!(matches!(
            BatchReport::load(&path),
            Err(ReportError::Schema { found: 99, .. })
        ));
    }

    #[test]
    fn test_tsv_columns() {
        let dir = TempDir::new().unwrap();
        let report = Aggregator::new().aggregate(&[
            result(dir.path(), "a", &[("wl", 12.0)]),
            result(dir.path(), "b", &[("fmax", 200.5)]),
        ]);
        let tsv = render_tsv(&report);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "job\tarch\tcircuit\tparams\tstatus\tfmax\twl");
        assert_eq!(lines[1], "k6/a/seed=1\tk6.xml\ta.v\tseed=1\tsuccess\t\t12");
        assert_eq!(lines[2], "k6/b/seed=1\tk6.xml\tb.v\tseed=1\tsuccess\t200.5\t");
    }

    #[test]
    fn test_job_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let r = result(dir.path(), "a", &[("wl", 3.0)]);
        let path = write_job_record(&r).unwrap();
        assert_eq!(load_job_record(&path).unwrap(), r);
    }
}
