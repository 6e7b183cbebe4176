//! Exit codes and outputs of the `cadflow` binary.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const CONFIG: &str = r#"
[flow]
work_root = "runs"
max_parallel = 2

[[stages]]
name = "synth"
command = "sh"
args = ["-c", "cp {circuit} {circuit_name}.blif"]
inputs = ["{circuit}", "{arch}"]
outputs = ["{circuit_name}.blif"]

[[stages]]
name = "report"
command = "sh"
args = ["-c", "test {circuit_name} != broken && echo 'QOR: luts = 4'"]
inputs = ["{circuit_name}.blif"]
"#;

fn setup(circuits: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("cadflow.toml"), CONFIG).unwrap();
    std::fs::write(dir.path().join("k6.xml"), "<architecture/>\n").unwrap();

    let mut task = String::from("arch_list_add=k6.xml\n");
    for circuit in circuits {
        std::fs::write(dir.path().join(format!("{}.v", circuit)), "module m; endmodule\n").unwrap();
        task.push_str(&format!("circuit_list_add={}.v\n", circuit));
    }
    std::fs::write(dir.path().join("task.txt"), task).unwrap();
    dir
}

fn cadflow(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cadflow"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("CADFLOW_CONFIG")
        .arg("--config")
        .arg(dir.join("cadflow.toml"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_run_success_writes_report() {
    let dir = setup(&["and2", "or2"]);
    let out = cadflow(dir.path(), &["run", "task.txt"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));

    let report = dir.path().join("runs/run001/batch_report.json");
    let text = std::fs::read_to_string(report).unwrap();
    assert!(text.contains("k6/and2/common"));
    assert!(text.contains("\"luts\": 4.0"));
}

#[test]
fn test_run_failure_exit_code() {
    let dir = setup(&["and2", "broken"]);
    let out = cadflow(dir.path(), &["run", "task.txt", "-j", "1"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_configuration_error_exit_code() {
    let dir = setup(&["and2"]);
    let out = cadflow(dir.path(), &["run", "task.txt", "--end-stage", "bitgen"]);
    assert_eq!(out.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&out.stderr).contains("bitgen"));
    assert!(!dir.path().join("runs/run001").exists());
}

#[test]
fn test_list_is_a_dry_run() {
    let dir = setup(&["and2"]);
    let out = cadflow(dir.path(), &["list", "task.txt", "--start-stage", "report"]);
    assert_eq!(out.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("k6/and2/common"));
    assert!(stdout.contains("report"));
    assert!(!dir.path().join("runs").exists());
}

#[test]
fn test_compare_reports() {
    let dir = setup(&["and2"]);
    let out = cadflow(dir.path(), &["run", "task.txt"]);
    assert_eq!(out.status.code(), Some(0));
    let out = cadflow(dir.path(), &["run", "task.txt"]);
    assert_eq!(out.status.code(), Some(0));

    let out = cadflow(
        dir.path(),
        &["compare", "runs/run002/batch_report.json", "runs/run001/batch_report.json"],
    );
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn test_list_file_selects_tasks() {
    let dir = setup(&["and2"]);
    std::fs::write(dir.path().join("nightly.lst"), "# nightly\n\ntask.txt\n").unwrap();

    let out = cadflow(dir.path(), &["run", "--list-file", "nightly.lst"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    let text = std::fs::read_to_string(dir.path().join("runs/run001/batch_report.json")).unwrap();
    assert!(text.contains("k6/and2/common"));
}

#[test]
fn test_parse_rebuilds_report_without_running() {
    let dir = setup(&["and2"]);
    let out = cadflow(dir.path(), &["run", "task.txt"]);
    assert_eq!(out.status.code(), Some(0));

    let job_dir = dir.path().join("runs/run001/k6/and2/common");
    std::fs::write(job_dir.join("report.log"), "QOR: luts = 9\n").unwrap();
    std::fs::remove_file(job_dir.join("and2.blif")).unwrap();

    let out = cadflow(dir.path(), &["run", "task.txt", "--parse"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    let text = std::fs::read_to_string(dir.path().join("runs/run001/batch_report.json")).unwrap();
    assert!(text.contains("\"luts\": 9.0"));
    assert!(!job_dir.join("and2.blif").exists());
    assert!(!dir.path().join("runs/run002").exists());
}

#[test]
fn test_golden_results_round_trip() {
    let dir = setup(&["and2", "or2"]);
    let out = cadflow(dir.path(), &["run", "task.txt"]);
    assert_eq!(out.status.code(), Some(0));

    let out = cadflow(dir.path(), &["run", "task.txt", "--create-golden"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    let golden = dir.path().join("golden_report.json");
    let text = std::fs::read_to_string(&golden).unwrap();
    assert!(text.contains("k6/or2/common"));
    assert!(!dir.path().join("runs/run002").exists());

    let out = cadflow(dir.path(), &["run", "task.txt", "--check-golden"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stdout));

    std::fs::write(&golden, text.replace("\"luts\": 4.0", "\"luts\": 2.0")).unwrap();
    let out = cadflow(dir.path(), &["run", "task.txt", "--check-golden"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stdout).contains("luts"));
    assert!(!dir.path().join("runs/run002").exists());
}

#[test]
fn test_check_golden_without_golden_is_an_error() {
    let dir = setup(&["and2"]);
    let out = cadflow(dir.path(), &["run", "task.txt"]);
    assert_eq!(out.status.code(), Some(0));

    let out = cadflow(dir.path(), &["run", "task.txt", "--check-golden"]);
    assert_eq!(out.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&out.stderr).contains("golden"));
}
