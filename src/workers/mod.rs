//! Worker fleet: bounded concurrency over the tiered task queue, per-task
//! deadlines with cooperative cancellation, retry with backoff, and a
//! periodic aggregate snapshot.

pub mod queue;

pub use queue::TaskQueue;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::monitor::{SessionMonitor, TaskOutcome};
use crate::types::{IngestError, Priority, Task, TaskKind};

/// What a finished task tells the scheduler.
#[derive(Debug, Clone)]
pub enum ReportOutcome {
    PollOk { new_messages: u32, supports_idle: bool },
    PollFailed { error: String, auth: bool },
    IdleOk { new_messages: u32 },
    IdleFailed { error: String },
    DegradedToPoll { new_messages: u32 },
    HealthOk,
    HealthFailed { error: String },
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub mailbox_id: String,
    pub kind: TaskKind,
    pub priority: Priority,
    pub outcome: ReportOutcome,
}

/// Aggregate numbers for the metrics surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FleetSnapshot {
    pub workers_total: usize,
    pub workers_active: usize,
    pub workers_idle: usize,
    pub queue_depth: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

struct WorkerCtx {
    queue: Arc<TaskQueue>,
    monitor: Arc<SessionMonitor>,
    settings: Arc<Settings>,
    reports: flume::Sender<TaskReport>,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct WorkerFleet {
    ctx: Arc<WorkerCtx>,
}

impl WorkerFleet {
    pub fn new(
        queue: Arc<TaskQueue>,
        monitor: Arc<SessionMonitor>,
        settings: Arc<Settings>,
    ) -> (Self, flume::Receiver<TaskReport>) {
        let (reports, reports_rx) = flume::unbounded();
        let fleet = Self {
            ctx: Arc::new(WorkerCtx {
                queue,
                monitor,
                settings,
                reports,
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        };
        (fleet, reports_rx)
    }

    /// Spawn the configured number of workers plus the metrics loop.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let count = self.ctx.settings.max_workers;
        info!(workers = count, "starting worker fleet");

        let mut handles = Vec::with_capacity(count + 1);
        for worker_id in 0..count {
            let ctx = self.ctx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, ctx, cancel).await;
            }));
        }

        let ctx = self.ctx.clone();
        let metrics_cancel = cancel;
        handles.push(tokio::spawn(async move {
            metrics_loop(ctx, metrics_cancel).await;
        }));

        handles
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            workers_total: self.ctx.settings.max_workers,
            workers_active: self.ctx.active.load(Ordering::Relaxed),
            workers_idle: self
                .ctx
                .settings
                .max_workers
                .saturating_sub(self.ctx.active.load(Ordering::Relaxed)),
            queue_depth: self.ctx.queue.len(),
            tasks_completed: self.ctx.completed.load(Ordering::Relaxed),
            tasks_failed: self.ctx.failed.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerCtx>, cancel: CancellationToken) {
    debug!(worker_id, "worker started");
    while let Some(task) = ctx.queue.recv(&cancel).await {
        ctx.active.fetch_add(1, Ordering::Relaxed);
        run_one(&ctx, task, &cancel).await;
        ctx.active.fetch_sub(1, Ordering::Relaxed);
    }
    debug!(worker_id, "worker stopped");
}

async fn run_one(ctx: &Arc<WorkerCtx>, task: Task, cancel: &CancellationToken) {
    let task_cancel = cancel.child_token();
    let deadline = ctx.settings.worker_timeout;
    let started = Instant::now();

    let result = tokio::select! {
        r = ctx.monitor.run_task(&task, &task_cancel) => r,
        _ = tokio::time::sleep(deadline) => {
            // Stuck worker: cancel the in-flight IMAP work and reclaim.
            task_cancel.cancel();
            Err(IngestError::Timeout(deadline))
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            ctx.completed.fetch_add(1, Ordering::Relaxed);
            info!(
                task_id = %task.id,
                mailbox_id = %task.mailbox.id,
                kind = task.kind.as_str(),
                priority = task.priority.as_str(),
                duration_ms,
                retry_count = task.retry_count,
                "task completed"
            );
            send_report(ctx, &task, report_for_outcome(outcome));
        }
        Err(IngestError::Timeout(_)) => {
            ctx.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %task.id,
                mailbox_id = %task.mailbox.id,
                kind = task.kind.as_str(),
                duration_ms,
                "task exceeded deadline, worker reclaimed"
            );
            if task.has_retry_budget() && !cancel.is_cancelled() {
                // Reclaimed work goes to the front of its tier.
                ctx.queue.push_front(task.retried());
            } else {
                send_report(
                    ctx,
                    &task,
                    report_for_error(&task, &IngestError::Timeout(deadline)),
                );
            }
        }
        Err(e) => {
            ctx.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %task.id,
                mailbox_id = %task.mailbox.id,
                kind = task.kind.as_str(),
                priority = task.priority.as_str(),
                duration_ms,
                retry_count = task.retry_count,
                error = %e,
                "task failed"
            );
            if task.has_retry_budget() && e.is_retriable() && !cancel.is_cancelled() {
                let retry = task.retried();
                let backoff = retry.retry_backoff();
                let queue = ctx.queue.clone();
                debug!(
                    task_id = %task.id,
                    backoff_ms = backoff.as_millis() as u64,
                    "re-enqueueing task after backoff"
                );
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    if queue.push(retry).is_err() {
                        warn!("task queue full, retry dropped");
                    }
                });
            } else {
                send_report(ctx, &task, report_for_error(&task, &e));
            }
        }
    }
}

fn report_for_outcome(outcome: TaskOutcome) -> ReportOutcome {
    match outcome {
        TaskOutcome::PollOk {
            new_messages,
            supports_idle,
        } => ReportOutcome::PollOk {
            new_messages,
            supports_idle,
        },
        TaskOutcome::IdleOk { new_messages } => ReportOutcome::IdleOk { new_messages },
        TaskOutcome::DegradedToPoll { new_messages } => {
            ReportOutcome::DegradedToPoll { new_messages }
        }
        TaskOutcome::HealthOk => ReportOutcome::HealthOk,
    }
}

fn report_for_error(task: &Task, error: &IngestError) -> ReportOutcome {
    let message = error.to_string();
    match task.kind {
        TaskKind::Poll => ReportOutcome::PollFailed {
            error: message,
            auth: matches!(error, IngestError::Auth(_)),
        },
        TaskKind::Idle => ReportOutcome::IdleFailed { error: message },
        TaskKind::HealthCheck => ReportOutcome::HealthFailed { error: message },
    }
}

fn send_report(ctx: &Arc<WorkerCtx>, task: &Task, outcome: ReportOutcome) {
    let report = TaskReport {
        mailbox_id: task.mailbox.id.clone(),
        kind: task.kind,
        priority: task.priority,
        outcome,
    };
    if ctx.reports.send(report).is_err() {
        debug!("scheduler report channel closed");
    }
}

async fn metrics_loop(ctx: Arc<WorkerCtx>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let (high, medium, low) = ctx.queue.depths();
                info!(
                    workers_total = ctx.settings.max_workers,
                    workers_active = ctx.active.load(Ordering::Relaxed),
                    queue_high = high,
                    queue_medium = medium,
                    queue_low = low,
                    tasks_completed = ctx.completed.load(Ordering::Relaxed),
                    tasks_failed = ctx.failed.load(Ordering::Relaxed),
                    "worker fleet status"
                );
            }
            _ = cancel.cancelled() => return,
        }
    }
}
