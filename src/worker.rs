//! Bounded pool for auxiliary jobs.
//!
//! Work that runs beside the loop (test suites, scanners) is submitted here
//! instead of blocking a state. A semaphore caps how many jobs run at once;
//! the rest wait as `pending` and can still be cancelled. Each job runs
//! under a child of the pool's cancellation token, so cancelling the
//! parent (an operator stop) ends queued and running jobs alike.
//!
//! ```rust,ignore
//! let pool = WorkerPool::new(2);
//! let id = pool.submit_command("tests", "cargo test", dir, Duration::from_secs(600));
//! let info = pool.wait(&id, Duration::from_secs(900)).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AutopatchError, Result};
use crate::r#loop::operations::run_shell;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Output of a completed job.
    pub output: Option<String>,
    /// Error of a failed job.
    pub error: Option<String>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The job already started or finished.
    CannotCancel(JobStatus),
}

impl std::fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::CannotCancel(status) => write!(f, "cannot cancel: job is {status}"),
        }
    }
}

type Jobs = Arc<Mutex<HashMap<String, JobInfo>>>;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    jobs: Jobs,
    finished: Arc<Notify>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Pool running at most `capacity` jobs at once (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie the pool to `parent`: cancelling it stops every job.
    #[must_use]
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    /// Stop all queued and running jobs. They finish as `cancelled`.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `job` and return its id. Must be called inside a tokio runtime.
    pub fn submit<F>(&self, name: impl Into<String>, job: F) -> String
    where
        F: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.into();
        lock(&self.jobs).insert(
            id.clone(),
            JobInfo {
                id: id.clone(),
                name: name.clone(),
                status: JobStatus::Pending,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
                output: None,
                error: None,
            },
        );
        debug!("Queued job {} ({})", id, name);

        let semaphore = Arc::clone(&self.semaphore);
        let jobs = Arc::clone(&self.jobs);
        let finished = Arc::clone(&self.finished);
        let token = self.shutdown.child_token();
        let job_id = id.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                () = token.cancelled() => {
                    finish_cancelled(&jobs, &job_id);
                    finished.notify_waiters();
                    return;
                }
            };
            let Ok(_permit) = permit else {
                finish(&jobs, &job_id, Err("worker pool closed".to_string()));
                finished.notify_waiters();
                return;
            };

            {
                let mut jobs = lock(&jobs);
                let Some(info) = jobs.get_mut(&job_id) else {
                    return;
                };
                if info.status != JobStatus::Pending {
                    return;
                }
                info.status = JobStatus::Running;
                info.started_at = Some(Utc::now());
            }
            info!("Job {} ({}) started", job_id, name);

            tokio::select! {
                result = job => {
                    let result = result.map_err(|e| format!("{e:#}"));
                    if let Err(e) = &result {
                        warn!("Job {} ({}) failed: {}", job_id, name, e);
                    }
                    finish(&jobs, &job_id, result);
                }
                () = token.cancelled() => {
                    info!("Job {} ({}) stopped by shutdown", job_id, name);
                    finish_cancelled(&jobs, &job_id);
                }
            }
            finished.notify_waiters();
        });
        id
    }

    /// Queue a shell command. The job fails when the command exits non-zero
    /// or runs past `timeout`.
    pub fn submit_command(
        &self,
        name: impl Into<String>,
        command: impl Into<String>,
        dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> String {
        let command = command.into();
        let dir = dir.into();
        self.submit(name, async move {
            let output = run_shell(&command, &dir, timeout).await?;
            if output.timed_out {
                anyhow::bail!("`{}` timed out after {}s", command, timeout.as_secs());
            }
            if !output.success() {
                anyhow::bail!(
                    "`{}` failed (exit {}):\n{}",
                    command,
                    output.code.unwrap_or(-1),
                    output.combined().trim()
                );
            }
            Ok(output.stdout)
        })
    }

    /// Current snapshot of a job.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::JobNotFound`] for an unknown id.
    pub fn status(&self, id: &str) -> Result<JobInfo> {
        lock(&self.jobs)
            .get(id)
            .cloned()
            .ok_or_else(|| AutopatchError::JobNotFound { id: id.to_string() })
    }

    /// Every job, oldest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = lock(&self.jobs).values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Wait until the job reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::JobNotFound`] for an unknown id, or
    /// [`AutopatchError::JobWaitTimeout`] if the job is still pending or
    /// running when `timeout` expires. The job itself keeps going.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<JobInfo> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let info = self.status(id)?;
            if info.status.is_terminal() {
                return Ok(info);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(AutopatchError::JobWaitTimeout {
                    id: id.to_string(),
                    status: info.status.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Wait for several jobs at once, sharing one timeout. Results come back
    /// in the order of `ids`.
    pub async fn wait_all(&self, ids: &[String], timeout: Duration) -> Vec<Result<JobInfo>> {
        futures::future::join_all(ids.iter().map(|id| self.wait(id, timeout))).await
    }

    /// Cancel a job that has not started yet.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::JobNotFound`] for an unknown id.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let outcome = {
            let mut jobs = lock(&self.jobs);
            let info = jobs
                .get_mut(id)
                .ok_or_else(|| AutopatchError::JobNotFound { id: id.to_string() })?;
            if info.status == JobStatus::Pending {
                info.status = JobStatus::Cancelled;
                info.finished_at = Some(Utc::now());
                CancelOutcome::Cancelled
            } else {
                CancelOutcome::CannotCancel(info.status)
            }
        };
        if outcome == CancelOutcome::Cancelled {
            info!("Job {} cancelled", id);
            self.finished.notify_waiters();
        }
        Ok(outcome)
    }
}

fn finish(jobs: &Jobs, id: &str, result: std::result::Result<String, String>) {
    let mut jobs = lock(jobs);
    let Some(info) = jobs.get_mut(id) else {
        return;
    };
    info.finished_at = Some(Utc::now());
    match result {
        Ok(output) => {
            info.status = JobStatus::Completed;
            info.output = Some(output);
        }
        Err(error) => {
            info.status = JobStatus::Failed;
            info.error = Some(error);
        }
    }
}

fn finish_cancelled(jobs: &Jobs, id: &str) {
    let mut jobs = lock(jobs);
    if let Some(info) = jobs.get_mut(id) {
        if !info.status.is_terminal() {
            info.status = JobStatus::Cancelled;
            info.finished_at = Some(Utc::now());
        }
    }
}

fn lock(jobs: &Jobs) -> MutexGuard<'_, HashMap<String, JobInfo>> {
    jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
