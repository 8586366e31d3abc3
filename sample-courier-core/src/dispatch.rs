//! Batch dispatcher: runs one [`Action`] over an ordered list of targets.
//!
//! # Modes
//! - [`ConcurrencyMode::Sequential`]: strict input order, a fixed delay after
//!   each target before the next one starts.
//! - [`ConcurrencyMode::BoundedParallel`]: a fixed number of workers (a
//!   semaphore over a `JoinSet`), one task per target, each task sleeping for
//!   the delay after its own action. [`Dispatcher::run`] returns only once every
//!   spawned task has finished.
//!
//! # Failures
//! [`FailurePolicy::FailFast`] stops at the first failed target: sequentially
//! nothing after it runs; in parallel a cancellation token keeps unstarted
//! tasks from running while in-flight ones finish and are drained.
//! [`FailurePolicy::Collect`] attempts every target and returns the failures
//! in the [`BatchReport`].

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contract::Session;
use crate::error::Error;
use crate::identity::ObjectKey;
use crate::targets::Target;

/// Delay between targets of a sequential analysis submission.
pub const SUBMIT_DELAY: Duration = Duration::from_secs(15);
/// Delay between targets of a sequential rescan-only batch.
pub const RESCAN_DELAY: Duration = Duration::from_secs(2);
/// Delay each parallel task applies after its own action.
pub const PARALLEL_TASK_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Upload,
    Rescan,
    Download,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Upload => "upload",
            ActionKind::Rescan => "rescan",
            ActionKind::Download => "download",
            ActionKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// One unit of work; built by the dispatcher per target and consumed once.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub target: Target,
    pub action: ActionKind,
    pub session: Option<Session>,
}

/// What happened to a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Submitted to the analysis service.
    Uploaded(ObjectKey),
    Rescanned(ObjectKey),
    /// Already known and no rescan was forced; nothing was sent.
    Skipped(ObjectKey),
    /// Written to object storage.
    Stored(ObjectKey),
    Downloaded { key: ObjectKey, path: PathBuf },
    Deleted(ObjectKey),
}

impl Outcome {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Outcome::Uploaded(k)
            | Outcome::Rescanned(k)
            | Outcome::Skipped(k)
            | Outcome::Stored(k)
            | Outcome::Deleted(k) => k,
            Outcome::Downloaded { key, .. } => key,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Uploaded(k) => write!(f, "uploaded {k}"),
            Outcome::Rescanned(k) => write!(f, "rescanned {k}"),
            Outcome::Skipped(k) => write!(f, "skipped {k} (already known)"),
            Outcome::Stored(k) => write!(f, "stored {k}"),
            Outcome::Downloaded { key, path } => write!(f, "downloaded {key} to {}", path.display()),
            Outcome::Deleted(k) => write!(f, "deleted {k}"),
        }
    }
}

/// Per-target behaviour plugged into the dispatcher.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Session attached to every job; storage-only actions have none.
    fn session(&self) -> Option<&Session> {
        None
    }

    async fn execute(&self, job: &BatchJob) -> crate::Result<Outcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    Sequential,
    BoundedParallel { workers: usize },
}

/// One worker per available CPU.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Collect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub mode: ConcurrencyMode,
    /// Sleep after each target (sequential) or inside each task (parallel).
    pub delay: Duration,
    pub failure_policy: FailurePolicy,
}

impl DispatchConfig {
    pub fn sequential(delay: Duration) -> Self {
        DispatchConfig {
            mode: ConcurrencyMode::Sequential,
            delay,
            failure_policy: FailurePolicy::FailFast,
        }
    }

    pub fn parallel(workers: usize, delay: Duration) -> Self {
        DispatchConfig {
            mode: ConcurrencyMode::BoundedParallel { workers },
            delay,
            failure_policy: FailurePolicy::FailFast,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{action} failed for {target}: {source}")]
    Item {
        target: Target,
        action: ActionKind,
        #[source]
        source: Error,
    },

    #[error("worker task aborted: {0}")]
    Worker(String),
}

#[derive(Debug)]
pub struct ItemFailure {
    pub target: Target,
    pub error: Error,
}

/// Result of a batch. `completed` is in input order for sequential runs and
/// in completion order for parallel runs.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<(Target, Outcome)>,
    pub failures: Vec<ItemFailure>,
    /// Targets that never ran because the batch was cancelled.
    pub not_started: usize,
}

impl BatchReport {
    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.completed.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.not_started == 0
    }

    fn record(&mut self, target: Target, outcome: Outcome) {
        info!(item = %target, outcome = %outcome, "Target done");
        self.completed.push((target, outcome));
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Dispatcher { config }
    }

    pub async fn run(
        &self,
        targets: Vec<Target>,
        action: Arc<dyn Action>,
    ) -> Result<BatchReport, DispatchError> {
        info!(
            targets = targets.len(),
            action = %action.kind(),
            mode = ?self.config.mode,
            delay_ms = self.config.delay.as_millis() as u64,
            policy = ?self.config.failure_policy,
            "Dispatching batch"
        );
        let report = match self.config.mode {
            ConcurrencyMode::Sequential => self.run_sequential(targets, action).await?,
            ConcurrencyMode::BoundedParallel { workers } => {
                self.run_parallel(targets, action, workers.max(1)).await?
            }
        };
        info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            not_started = report.not_started,
            "Batch finished"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        targets: Vec<Target>,
        action: Arc<dyn Action>,
    ) -> Result<BatchReport, DispatchError> {
        let mut report = BatchReport::default();
        let total = targets.len();

        for (index, target) in targets.into_iter().enumerate() {
            let job = make_job(target, action.as_ref());
            debug!(item = %job.target, position = index + 1, total, "Starting job");

            match action.execute(&job).await {
                Ok(outcome) => report.record(job.target, outcome),
                Err(error) => {
                    error!(item = %job.target, action = %job.action, error = %error, "Job failed");
                    match self.config.failure_policy {
                        FailurePolicy::FailFast => {
                            warn!(skipped = total - index - 1, "Aborting batch after failure");
                            return Err(DispatchError::Item {
                                target: job.target,
                                action: job.action,
                                source: error,
                            });
                        }
                        FailurePolicy::Collect => report.failures.push(ItemFailure {
                            target: job.target,
                            error,
                        }),
                    }
                }
            }

            if index + 1 < total && !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }
        }
        Ok(report)
    }

    async fn run_parallel(
        &self,
        targets: Vec<Target>,
        action: Arc<dyn Action>,
        workers: usize,
    ) -> Result<BatchReport, DispatchError> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let cancel = CancellationToken::new();
        let fail_fast = self.config.failure_policy == FailurePolicy::FailFast;
        let delay = self.config.delay;
        let mut tasks: JoinSet<(BatchJob, Option<crate::Result<Outcome>>)> = JoinSet::new();
        let mut report = BatchReport::default();

        info!(workers, "Starting worker pool");
        for target in targets {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => {
                    report.not_started += 1;
                    continue;
                }
            };

            let job = make_job(target, action.as_ref());
            let action = action.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return (job, None);
                }
                let result = action.execute(&job).await;
                if result.is_err() && fail_fast {
                    cancel.cancel();
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (job, Some(result))
            });
        }

        // Drain: no task outlives this call.
        let mut first_error: Option<DispatchError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((job, Some(Ok(outcome)))) => report.record(job.target, outcome),
                Ok((job, Some(Err(error)))) => {
                    error!(item = %job.target, action = %job.action, error = %error, "Job failed");
                    if fail_fast {
                        if first_error.is_none() {
                            first_error = Some(DispatchError::Item {
                                target: job.target,
                                action: job.action,
                                source: error,
                            });
                        }
                    } else {
                        report.failures.push(ItemFailure {
                            target: job.target,
                            error,
                        });
                    }
                }
                Ok((job, None)) => {
                    debug!(item = %job.target, "Job cancelled before start");
                    report.not_started += 1;
                }
                Err(join_error) => {
                    error!(error = %join_error, "Worker task aborted");
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(DispatchError::Worker(join_error.to_string()));
                    }
                }
            }
        }

        match first_error {
            Some(e) => {
                warn!(
                    completed = report.completed.len(),
                    not_started = report.not_started,
                    "Batch aborted after failure"
                );
                Err(e)
            }
            None => Ok(report),
        }
    }
}

fn make_job(target: Target, action: &dyn Action) -> BatchJob {
    BatchJob {
        target,
        action: action.kind(),
        session: action.session().cloned(),
    }
}
