//! Application context: explicit construction and wiring of every
//! component, the mailbox refresh loop, and graceful shutdown.
//!
//! Nothing here is a singleton — the context owns the component graph and
//! threads references by construction. Only the tracing subscriber and the
//! settings snapshot are process-global, both installed in `main` before
//! the context exists.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::queue::{HttpQueueTransport, SinkAdapter};
use crate::adapters::sqlite::{self, DbPool, StatusStore};
use crate::config::Settings;
use crate::monitor::SessionMonitor;
use crate::pool::{ConnectionPool, PoolEvent};
use crate::scheduler::Scheduler;
use crate::types::IngestError;
use crate::workers::{TaskQueue, TaskReport, WorkerFleet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub database: bool,
    pub sink: bool,
    pub workers: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub accounts_scheduled: usize,
    pub connections_active: usize,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub queue_depth: usize,
    pub workers_active: usize,
    pub workers_total: usize,
    pub uptime_secs: u64,
    pub memory_rss_bytes: u64,
}

pub struct AppContext {
    pub settings: Arc<Settings>,
    pub db: DbPool,
    pub status: Arc<StatusStore>,
    pub sink: Arc<SinkAdapter>,
    pub pool: Arc<ConnectionPool>,
    pub scheduler: Arc<Scheduler>,
    pub queue: Arc<TaskQueue>,
    pub fleet: WorkerFleet,
    pub cancel: CancellationToken,
    reports_rx: Mutex<Option<flume::Receiver<TaskReport>>>,
    pool_events_rx: Mutex<Option<flume::Receiver<PoolEvent>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl AppContext {
    /// Build the whole component graph. Fails fast when the store cannot
    /// be opened — there is nothing to run without it.
    pub fn new(settings: Arc<Settings>) -> Result<Self, IngestError> {
        let db = sqlite::create_pool(&settings.database_path)?;
        {
            let conn = db.get()?;
            sqlite::schema::initialize_schema(&conn)?;
        }

        let status = Arc::new(StatusStore::new(db.clone()));
        let transport = Arc::new(HttpQueueTransport::new(settings.sink_url.clone()));
        let sink = Arc::new(SinkAdapter::new(
            transport,
            settings.sink_max_batch,
            settings.max_message_bytes,
            settings.truncate_at_bytes,
        ));

        let (pool, pool_events_rx) = ConnectionPool::new(settings.clone(), status.clone());
        let pool = Arc::new(pool);

        let queue = Arc::new(TaskQueue::new(settings.task_queue_size));
        let monitor = Arc::new(SessionMonitor::new(
            pool.clone(),
            sink.clone(),
            status.clone(),
            settings.clone(),
        ));
        let (fleet, reports_rx) = WorkerFleet::new(queue.clone(), monitor, settings.clone());
        let scheduler = Arc::new(Scheduler::new(settings.clone(), queue.clone()));

        Ok(Self {
            settings,
            db,
            status,
            sink,
            pool,
            scheduler,
            queue,
            fleet,
            cancel: CancellationToken::new(),
            reports_rx: Mutex::new(Some(reports_rx)),
            pool_events_rx: Mutex::new(Some(pool_events_rx)),
            worker_handles: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    /// Load the schedule and start every background loop.
    pub async fn start(&self) -> Result<(), IngestError> {
        // Initial load is fatal: a store that cannot be queried at startup
        // leaves nothing to schedule.
        let count = self.refresh_mailboxes(&mut HashSet::new())?;
        info!(mailboxes = count, "initial mailbox load complete");

        // Mailboxes that were mid-connection when the previous process died
        // get serviced on the first tick instead of waiting out the smear.
        match self.status.needing_reconnection() {
            Ok(ids) => {
                for id in &ids {
                    self.scheduler.note_session_died(id);
                }
                if !ids.is_empty() {
                    info!(count = ids.len(), "pulled reconnect-pending mailboxes forward");
                }
            }
            Err(e) => warn!(error = %e, "reconnection lookup failed"),
        }

        let handles = self.fleet.spawn(self.cancel.clone());
        self.worker_handles
            .lock()
            .expect("worker handle lock")
            .extend(handles);

        let reports_rx = self
            .reports_rx
            .lock()
            .expect("reports lock")
            .take()
            .ok_or_else(|| IngestError::Config("context already started".into()))?;
        let pool_events_rx = self
            .pool_events_rx
            .lock()
            .expect("pool events lock")
            .take()
            .ok_or_else(|| IngestError::Config("context already started".into()))?;

        tokio::spawn(self.scheduler.clone().run(
            self.cancel.clone(),
            reports_rx,
            pool_events_rx,
        ));
        tokio::spawn(self.pool.clone().run_maintenance(self.cancel.clone()));

        // Mailbox refresh loop
        let db = self.db.clone();
        let status = self.status.clone();
        let scheduler = self.scheduler.clone();
        let settings = self.settings.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            let mut tick = tokio::time::interval(settings.mailbox_refresh_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = refresh_once(&db, &status, &scheduler, &mut known) {
                            // Transient store trouble; keep the current schedule.
                            error!(error = %e, "mailbox refresh failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    fn refresh_mailboxes(&self, known: &mut HashSet<String>) -> Result<usize, IngestError> {
        refresh_once(&self.db, &self.status, &self.scheduler, known)
    }

    /// Graceful shutdown: stop emitting, drain in-flight work up to the
    /// deadline, close sessions.
    pub async fn shutdown(&self) {
        info!("shutdown initiated");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.worker_handles.lock().expect("worker handle lock");
            guard.drain(..).collect()
        };

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.settings.shutdown_drain_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                deadline_secs = self.settings.shutdown_drain_timeout.as_secs(),
                "drain deadline exceeded, abandoning in-flight tasks"
            );
        }

        self.pool.close_all().await;
        info!("shutdown complete");
    }

    pub fn health(&self) -> HealthSnapshot {
        let database = self
            .db
            .get()
            .map(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .is_ok()
            })
            .unwrap_or(false);
        let sink = self.sink.is_healthy();
        let workers = !self.cancel.is_cancelled();

        let status = if !database {
            HealthStatus::Unhealthy
        } else if !sink || !workers {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            database,
            sink,
            workers,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let fleet = self.fleet.snapshot();
        let (messages_processed, messages_failed) =
            self.status.totals().unwrap_or((0, 0));

        MetricsSnapshot {
            accounts_scheduled: self.scheduler.entry_count(),
            connections_active: self.pool.total_live(),
            messages_processed,
            messages_failed,
            tasks_completed: fleet.tasks_completed,
            tasks_failed: fleet.tasks_failed,
            queue_depth: fleet.queue_depth,
            workers_active: fleet.workers_active,
            workers_total: fleet.workers_total,
            uptime_secs: self.started_at.elapsed().as_secs(),
            memory_rss_bytes: memory_rss_bytes(),
        }
    }
}

fn refresh_once(
    db: &DbPool,
    status: &StatusStore,
    scheduler: &Scheduler,
    known: &mut HashSet<String>,
) -> Result<usize, IngestError> {
    let mailboxes = sqlite::mailboxes::list_active(db)?;
    let current: HashSet<String> = mailboxes.iter().map(|m| m.id.clone()).collect();

    for mailbox in &mailboxes {
        status.ensure_exists(&mailbox.id)?;
        if !known.contains(&mailbox.id) {
            status.set_active(&mailbox.id, true)?;
        }
    }
    for gone in known.difference(&current) {
        if let Err(e) = status.set_active(gone, false) {
            warn!(mailbox_id = %gone, error = %e, "failed to deactivate status row");
        }
    }

    let count = mailboxes.len();
    scheduler.sync_mailboxes(mailboxes);
    *known = current;
    Ok(count)
}

/// Resident set size from procfs; zero where unavailable.
fn memory_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return rss_pages * 4096;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::mailboxes::{self, tests::sample_mailbox, tests::test_pool};
    use crate::workers::TaskQueue;

    #[test]
    fn test_refresh_schedules_and_deactivates() {
        let db = test_pool();
        let status = StatusStore::new(db.clone());
        let scheduler = Scheduler::new(
            Arc::new(Settings::default()),
            Arc::new(TaskQueue::new(100)),
        );
        let mut known = HashSet::new();

        mailboxes::upsert(&db, &sample_mailbox("mb-1")).unwrap();
        mailboxes::upsert(&db, &sample_mailbox("mb-2")).unwrap();

        let count = refresh_once(&db, &status, &scheduler, &mut known).unwrap();
        assert_eq!(count, 2);
        assert_eq!(scheduler.entry_count(), 2);
        assert!(status.get("mb-1").unwrap().unwrap().active);

        // Deactivate one; the next refresh removes it from the schedule
        // and flips its status row.
        mailboxes::set_active(&db, "mb-2", false).unwrap();
        let count = refresh_once(&db, &status, &scheduler, &mut known).unwrap();
        assert_eq!(count, 1);
        assert_eq!(scheduler.entry_count(), 1);
        assert!(!status.get("mb-2").unwrap().unwrap().active);
    }
}
