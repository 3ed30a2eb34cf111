use std::collections::VecDeque;
use std::ffi::OsString;
use std::process::{Child, Command, ExitStatus};

use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;
use tracing::{error, info, warn};

/// Runs `f` inside a dedicated rayon pool when a thread count is given,
/// otherwise on the global pool.
pub fn run_in_pool<T, F>(threads: Option<usize>, context: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    match threads {
        Some(n) => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .context(context)?;
            Ok(pool.install(f))
        }
        None => Ok(f()),
    }
}

/// Caps a requested worker count at the number of tasks.
pub fn resolve_workers(requested: usize, tasks: usize) -> usize {
    let capped = requested.clamp(1, tasks.max(1));
    if requested > capped {
        warn!("requested {requested} workers for {tasks} tasks; using {capped}");
    }
    capped
}

/// One child invocation of the current executable.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub label: String,
    pub args: Vec<OsString>,
}

#[derive(Debug)]
pub struct WorkerOutcome {
    pub label: String,
    pub status: ExitStatus,
}

/// Re-invokes the running binary once per task, keeping at most `workers`
/// children alive. Every child runs to completion; failures are reported
/// together at the end.
pub fn run_worker_processes(tasks: Vec<WorkerTask>, workers: usize) -> Result<Vec<WorkerOutcome>> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let workers = workers.max(1);
    let mut pending: VecDeque<WorkerTask> = tasks.into();
    let mut running: Vec<(String, Child)> = Vec::with_capacity(workers);
    let mut outcomes = Vec::with_capacity(pending.len());

    while !pending.is_empty() || !running.is_empty() {
        while running.len() < workers
            && let Some(task) = pending.pop_front()
        {
            info!("starting worker {}", task.label);
            let child = Command::new(&exe)
                .args(&task.args)
                .spawn()
                .with_context(|| format!("spawn worker {}", task.label))?;
            running.push((task.label, child));
        }

        // Wait on the oldest child; the others keep running meanwhile.
        let (label, mut child) = running.remove(0);
        let status = child
            .wait()
            .with_context(|| format!("wait for worker {label}"))?;
        if status.success() {
            info!("worker {label} finished");
        } else {
            error!("worker {label} failed with {status}");
        }
        outcomes.push(WorkerOutcome { label, status });
    }

    Ok(outcomes)
}

/// Errors when any worker exited unsuccessfully.
pub fn check_worker_outcomes(outcomes: &[WorkerOutcome]) -> Result<()> {
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.status.success())
        .map(|o| o.label.as_str())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} worker(s) failed: {}", failed.len(), failed.join(", "))
    }
}
