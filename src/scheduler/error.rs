//! Scheduler error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::{PipelineError, TemplateError};
use crate::report::{BatchReport, ReportError};

/// Configuration problems found before any job is dispatched.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("duplicate job {key}: declared at {first} and again at {second}")]
    DuplicateJob {
        key: String,
        first: String,
        second: String,
    },

    #[error("jobs {first} and {second} would share working directory {key}")]
    KeyCollision {
        key: String,
        first: String,
        second: String,
    },

    #[error("job {key} ({origin}) would overwrite the batch file {file}")]
    ReservedKey {
        key: String,
        origin: String,
        file: &'static str,
    },

    #[error("job {key} ({origin}): {source}")]
    StageRange {
        key: String,
        origin: String,
        #[source]
        source: PipelineError,
    },

    #[error("job {key} ({origin}), stage '{stage}': {source}")]
    Template {
        key: String,
        origin: String,
        stage: String,
        #[source]
        source: TemplateError,
    },

    #[error("job {key} ({origin}): {source}")]
    Params {
        key: String,
        origin: String,
        #[source]
        source: TemplateError,
    },

    #[error("cannot prepare batch directory {path}: {source}")]
    BatchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Jobs ran but the report could not be written. Carries the report so
    /// callers can still summarize the batch.
    #[error("batch finished but the report could not be written: {source}")]
    ReportWrite {
        report: Box<BatchReport>,
        #[source]
        source: ReportError,
    },
}
