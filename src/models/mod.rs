//! Data models shared by the pipeline, scheduler and reporter.

mod job;
mod outcome;

pub use job::{sanitize_component, JobIdentity, JobSpec, RecordOrigin, COMMON_SLUG};
pub use outcome::{JobResult, JobStatus, StageOutcome, StageStatus};
