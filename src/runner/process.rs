//! Spawning tool processes and stopping them.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a supervised process ended.
#[derive(Debug)]
pub enum ProcessExit {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    /// The process could not be started (or waited on).
    Failed(io::Error),
}

/// Everything needed to launch one tool invocation.
pub struct ProcessSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: Vec<(&'static str, String)>,
    /// Receives both stdout and stderr.
    pub log: File,
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// Run a process to completion, killing it on timeout or cancellation.
///
/// The process leads its own process group, so a timeout or cancellation
/// takes down anything it spawned as well.
pub async fn supervise(
    spec: ProcessSpec<'_>,
    timeout: Duration,
    cancel: &CancellationToken,
    kill_grace: Duration,
) -> ProcessExit {
    let stdout = match spec.log.try_clone() {
        Ok(f) => f,
        Err(e) => return ProcessExit::Failed(e),
    };

    let mut cmd = Command::new(spec.program);
    cmd.args(spec.args)
        .current_dir(spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(spec.log))
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessExit::Failed(e),
    };
    let pid = child.id();
    debug!("Spawned {} (pid {:?})", spec.program, pid);

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = tokio::time::sleep(timeout) => Wake::Deadline,
        _ = cancel.cancelled() => Wake::Cancelled,
    };

    match wake {
        Wake::Exited(Ok(status)) => ProcessExit::Exited(status),
        Wake::Exited(Err(e)) => {
            terminate(&mut child, pid, kill_grace).await;
            ProcessExit::Failed(e)
        }
        Wake::Deadline => {
            terminate(&mut child, pid, kill_grace).await;
            ProcessExit::TimedOut
        }
        Wake::Cancelled => {
            terminate(&mut child, pid, kill_grace).await;
            ProcessExit::Cancelled
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// SIGTERM the whole group, then SIGKILL whatever is left after `grace`.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, Signal::Term);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => signal_group(pid, Signal::Kill),
        Err(_) => {
            warn!(
                "Process {:?} still running {}ms after SIGTERM, killing",
                pid,
                grace.as_millis()
            );
            signal_group(pid, Signal::Kill);
            if let Err(e) = child.start_kill() {
                debug!("start_kill: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
    unsafe {
        libc::killpg(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}
