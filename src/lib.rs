//! cadflow - batch runner for FPGA CAD flows.
//!
//! Pushes (circuit, architecture, parameter-set) jobs through an ordered
//! pipeline of external tools (elaboration, synthesis, packing, placement,
//! routing, timing analysis), with bounded parallelism, per-stage and per-job
//! timeouts, retries of flaky stages, and a diffable batch report.

pub mod config;
pub mod job;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod task;

pub use config::{Config, DuplicatePolicy, FlowConfig};
pub use job::{Job, JobError, JobOptions, JobState};
pub use models::{JobIdentity, JobResult, JobSpec, JobStatus, StageOutcome, StageStatus};
pub use pipeline::{PipelineDefinition, PipelineError, Stage};
pub use report::{Aggregator, BatchOutcome, BatchReport};
pub use runner::{StageContext, StageExecutor, StageRunner};
pub use scheduler::{BatchError, BatchEvent, RetryPolicy, Scheduler, SchedulerOptions};
pub use task::{load_task, load_tasks, TaskError, TaskFile};
