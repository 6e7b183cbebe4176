//! Progress events emitted while a batch runs.

use std::time::Duration;

use crate::models::{JobStatus, StageStatus};

/// Progress events from the scheduler and its jobs.
///
/// Consumers (progress bars, loggers) receive these over an mpsc channel;
/// a dropped receiver never stalls the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// The batch is about to start with `total` jobs.
    BatchStarted {
        total: usize,
        workers: usize,
    },
    JobStarted {
        key: String,
        attempt: u32,
        worker: usize,
    },
    StageStarted {
        key: String,
        stage: String,
    },
    StageFinished {
        key: String,
        stage: String,
        status: StageStatus,
        duration: Duration,
        resumed: bool,
    },
    JobRetrying {
        key: String,
        next_attempt: u32,
        reason: String,
    },
    JobFinished {
        key: String,
        status: JobStatus,
        degraded: bool,
        attempts: u32,
    },
    /// A job was never dispatched because the batch was cancelled.
    JobSkipped {
        key: String,
    },
}
