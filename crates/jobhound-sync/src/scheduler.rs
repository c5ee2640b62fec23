//! Bounded concurrency scheduler: one task per source, `W` workers, per-task timeout,
//! and an overall run deadline. Every task gets exactly one result slot.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Stand-in deadline when the derived one does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    StatusError,
    ParseError,
    Timeout,
    TransportError,
    TaskFailed,
    ConfigError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::StatusError => "status-error",
            FailureKind::ParseError => "parse-error",
            FailureKind::Timeout => "timeout",
            FailureKind::TransportError => "transport-error",
            FailureKind::TaskFailed => "task-failed",
            FailureKind::ConfigError => "config-error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed, source-level failure. Never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct SourceFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl SourceFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Result<T, SourceFailure>> + Send + 'static>>;

pub struct ScheduledTask<T> {
    pub name: String,
    /// Overrides [`SchedulerConfig::task_timeout`] for this task.
    pub timeout: Option<Duration>,
    pub future: TaskFuture<T>,
}

impl<T> ScheduledTask<T> {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T, SourceFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: None,
            future: Box::pin(future),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub task_timeout: Duration,
    pub deadline_slack: Duration,
    /// Fixed deadline instead of the derived one.
    pub deadline: Option<Duration>,
}

impl SchedulerConfig {
    /// `T_max * ceil(N / W) + slack`, where `T_max` is the largest effective task timeout.
    pub fn deadline_for(&self, timeouts: impl IntoIterator<Item = Duration>, task_count: usize) -> Duration {
        if let Some(deadline) = self.deadline {
            return deadline;
        }
        let workers = self.max_workers.max(1);
        let waves = u32::try_from(task_count.div_ceil(workers)).unwrap_or(u32::MAX);
        let t_max = timeouts.into_iter().fold(self.task_timeout, Duration::max);
        t_max.saturating_mul(waves).saturating_add(self.deadline_slack)
    }
}

#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub name: String,
    pub elapsed: Duration,
    pub result: Result<T, SourceFailure>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

/// Run `tasks` with at most `config.max_workers` in flight.
///
/// Returns one outcome per task, in input order, whatever happened to the task. The
/// per-task timeout starts once a task holds a worker permit.
pub async fn run_bounded<T: Send + 'static>(
    tasks: Vec<ScheduledTask<T>>,
    config: SchedulerConfig,
) -> Vec<TaskOutcome<T>> {
    if tasks.is_empty() {
        return Vec::new();
    }

    let workers = config.max_workers.max(1);
    let deadline = config.deadline_for(tasks.iter().filter_map(|t| t.timeout), tasks.len());
    let now = Instant::now();
    let deadline_at = now
        .checked_add(deadline)
        .unwrap_or_else(|| now + FAR_FUTURE);
    let semaphore = Arc::new(Semaphore::new(workers));

    let names = tasks.iter().map(|t| t.name.clone()).collect::<Vec<_>>();
    let mut slots: Vec<Option<(Result<T, SourceFailure>, Duration)>> =
        std::iter::repeat_with(|| None).take(tasks.len()).collect();

    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let limit = task.timeout.unwrap_or(config.task_timeout);
        let span = info_span!("scheduled_task", task = %task.name, index);
        set.spawn(
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (
                        index,
                        Err(SourceFailure::new(FailureKind::TaskFailed, "worker pool closed")),
                        Duration::ZERO,
                    );
                };
                let started = Instant::now();
                let guarded = AssertUnwindSafe(task.future).catch_unwind();
                let result = match tokio::time::timeout(limit, guarded).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(SourceFailure::new(
                        FailureKind::TaskFailed,
                        panic_message(panic.as_ref()),
                    )),
                    Err(_) => Err(SourceFailure::new(
                        FailureKind::Timeout,
                        format!("no result within {}s", limit.as_secs_f64()),
                    )),
                };
                (index, result, started.elapsed())
            }
            .instrument(span),
        );
    }

    loop {
        match tokio::time::timeout_at(deadline_at, set.join_next()).await {
            Ok(Some(Ok((index, result, elapsed)))) => {
                if let Some(slot) = slots.get_mut(index) {
                    if slot.is_none() {
                        *slot = Some((result, elapsed));
                    } else {
                        debug!(index, "ignoring late duplicate result");
                    }
                }
            }
            Ok(Some(Err(err))) => {
                warn!(error = %err, "scheduled task ended without a result");
            }
            Ok(None) => break,
            Err(_) => {
                let pending = slots.iter().filter(|s| s.is_none()).count();
                warn!(
                    pending,
                    deadline_secs = deadline.as_secs_f64(),
                    "run deadline reached; aborting remaining tasks"
                );
                set.abort_all();
                break;
            }
        }
    }

    let deadline_hit = Instant::now() >= deadline_at;
    names
        .into_iter()
        .zip(slots)
        .map(|(name, slot)| match slot {
            Some((result, elapsed)) => TaskOutcome {
                name,
                elapsed,
                result,
            },
            None if deadline_hit => TaskOutcome {
                name,
                elapsed: deadline,
                result: Err(SourceFailure::new(
                    FailureKind::Timeout,
                    format!("aborted at run deadline ({}s)", deadline.as_secs_f64()),
                )),
            },
            None => TaskOutcome {
                name,
                elapsed: Duration::ZERO,
                result: Err(SourceFailure::new(
                    FailureKind::TaskFailed,
                    "task ended without a result",
                )),
            },
        })
        .collect()
}
