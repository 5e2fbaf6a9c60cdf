//! Session monitor: per-task IMAP interaction.
//!
//! Poll mode walks the contiguous range of new messages above the
//! mailbox's watermark, fetching in small batches and submitting each
//! batch to the sink before the watermark advances past it. IDLE mode
//! holds the session in IDLE rounds, draining new mail on every EXISTS
//! push; a failed IDLE startup *returns* a degrade-to-poll outcome rather
//! than falling back from an error path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::imap::envelopes::{self, ObservedMessage};
use crate::adapters::imap::IdleOutcome;
use crate::adapters::queue::SinkAdapter;
use crate::adapters::sqlite::{Counter, StatusStore};
use crate::config::{ParseMode, Settings};
use crate::pool::{ConnectionPool, SessionLease};
use crate::types::{ConnState, Envelope, IngestError, Task, TaskKind};

/// Messages fetched per FETCH round-trip within a poll cycle.
const FETCH_BATCH: u32 = 10;

/// An IDLE task hands its session back this long before the worker
/// deadline so it never trips the stuck-worker reclaim.
const IDLE_DEADLINE_MARGIN: Duration = Duration::from_secs(60);

/// What a completed task observed. Failures travel as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    PollOk { new_messages: u32, supports_idle: bool },
    IdleOk { new_messages: u32 },
    /// IDLE never started; the poll ran on the same borrow instead.
    DegradedToPoll { new_messages: u32 },
    HealthOk,
}

pub struct SessionMonitor {
    pool: Arc<ConnectionPool>,
    sink: Arc<SinkAdapter>,
    status: Arc<StatusStore>,
    settings: Arc<Settings>,
}

impl SessionMonitor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        sink: Arc<SinkAdapter>,
        status: Arc<StatusStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            pool,
            sink,
            status,
            settings,
        }
    }

    /// Borrow the mailbox's session, run the task, and hand the session
    /// back — discarded when the error poisons it, cached otherwise.
    pub async fn run_task(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, IngestError> {
        let mut lease = self.pool.acquire(&task.mailbox, task.priority, cancel).await?;

        let result = match task.kind {
            TaskKind::Poll => self.run_poll(task, &mut lease, cancel).await,
            TaskKind::Idle => self.run_idle(task, &mut lease, cancel).await,
            TaskKind::HealthCheck => match lease.conn() {
                Ok(conn) => conn.noop().await.map(|_| TaskOutcome::HealthOk),
                Err(e) => Err(e),
            },
        };

        match &result {
            Err(e) if e.poisons_session() => self.pool.discard(lease).await,
            _ => self.pool.release(lease).await,
        }

        result
    }

    async fn run_poll(
        &self,
        task: &Task,
        lease: &mut SessionLease,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, IngestError> {
        let supports_idle = lease.conn()?.supports_idle;
        let new_messages = self
            .poll_cycle(&task.mailbox.id, lease, cancel)
            .await?;
        Ok(TaskOutcome::PollOk {
            new_messages,
            supports_idle,
        })
    }

    /// One poll cycle: EXISTS vs watermark, batch fetch, ordered submit,
    /// watermark advance per fully-submitted batch.
    ///
    /// The pool's exclusive borrow serves as the mailbox lock for the
    /// duration of the cycle.
    async fn poll_cycle(
        &self,
        mailbox_id: &str,
        lease: &mut SessionLease,
        cancel: &CancellationToken,
    ) -> Result<u32, IngestError> {
        let exists = lease.conn()?.examine_inbox().await?;

        let watermark = match self.status.watermark(mailbox_id)? {
            Some(w) => w,
            None => {
                // Fresh start: no backfill of historical mail.
                info!(
                    mailbox_id = %mailbox_id,
                    exists,
                    "no watermark yet, starting at current EXISTS"
                );
                self.status.set_watermark(mailbox_id, exists)?;
                self.status.increment(mailbox_id, Counter::Successes, 1)?;
                return Ok(0);
            }
        };

        if exists <= watermark {
            self.status.increment(mailbox_id, Counter::Successes, 1)?;
            return Ok(0);
        }

        debug!(
            mailbox_id = %mailbox_id,
            watermark,
            exists,
            "processing new message range"
        );

        let mut submitted = 0u32;
        let mut start = watermark + 1;
        while start <= exists {
            if cancel.is_cancelled() {
                // The current batch was not fully submitted, so the
                // watermark stays where the last complete batch left it.
                return Err(IngestError::Cancelled);
            }
            let end = (start + FETCH_BATCH - 1).min(exists);
            submitted += self.fetch_and_submit(mailbox_id, lease, start, end).await?;
            self.status.set_watermark(mailbox_id, end)?;
            start = end + 1;
        }

        if submitted > 0 {
            self.status
                .increment(mailbox_id, Counter::MessagesProcessed, submitted as u64)?;
        }
        self.status.increment(mailbox_id, Counter::Successes, 1)?;
        Ok(submitted)
    }

    /// Fetch `[start, end]`, build envelopes, and submit them in sequence
    /// order. Messages that cannot yield an id are dropped with a warning.
    async fn fetch_and_submit(
        &self,
        mailbox_id: &str,
        lease: &mut SessionLease,
        start: u32,
        end: u32,
    ) -> Result<u32, IngestError> {
        let fetches = lease.conn()?.fetch_range(start, end).await?;

        // References lives outside the ENVELOPE; a failed header fetch
        // costs the thread context, not the batch.
        let mut refs_by_seq: HashMap<u32, Vec<String>> =
            match lease.conn()?.fetch_reference_headers(start, end).await {
                Ok(ref_fetches) => ref_fetches
                    .iter()
                    .map(|f| (f.message, envelopes::references_from_fetch(f)))
                    .collect(),
                Err(e) => {
                    warn!(
                        mailbox_id = %mailbox_id,
                        error = %e,
                        "references fetch failed, continuing without"
                    );
                    HashMap::new()
                }
            };

        let mut observed: Vec<ObservedMessage> = fetches
            .iter()
            .filter_map(|fetch| {
                let refs = refs_by_seq.remove(&fetch.message).unwrap_or_default();
                envelopes::observed_from_fetch(mailbox_id, fetch, refs)
            })
            .collect();
        observed.sort_by_key(|m| m.seq);

        let mut batch: Vec<Envelope> = observed.into_iter().map(|m| m.envelope).collect();

        if self.settings.parse_mode == ParseMode::Full {
            for envelope in &mut batch {
                match envelopes::parse_full_source(envelope.body_text.as_bytes()) {
                    Ok((text, attachments)) => {
                        envelope.body_text = text;
                        envelope.attachments = attachments;
                    }
                    Err(e) => {
                        // Keep the raw source; downstream can still decode it.
                        warn!(
                            mailbox_id = %mailbox_id,
                            internal_id = %envelope.internal_id,
                            error = %e,
                            "full parse failed, passing raw source through"
                        );
                    }
                }
            }
        }

        self.sink.submit(&mut batch).await?;
        Ok(batch.len() as u32)
    }

    async fn run_idle(
        &self,
        task: &Task,
        lease: &mut SessionLease,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, IngestError> {
        let mailbox_id = task.mailbox.id.clone();
        let startup = self.settings.idle_timeout;
        let wait = self.settings.noop_interval;
        let budget = self
            .settings
            .worker_timeout
            .saturating_sub(IDLE_DEADLINE_MARGIN);
        let started = Instant::now();

        // Drain whatever arrived since the last service before idling.
        let mut new_messages = self.poll_cycle(&mailbox_id, lease, cancel).await?;

        // First round decides whether IDLE works here at all.
        match lease.conn()?.idle_round(startup, wait).await {
            Ok(outcome) => {
                self.status.set_state(&mailbox_id, ConnState::Idle, None)?;
                if outcome == IdleOutcome::NewData {
                    new_messages += self.poll_cycle(&mailbox_id, lease, cancel).await?;
                }
            }
            Err(e) => {
                warn!(
                    mailbox_id = %mailbox_id,
                    error = %e,
                    "IDLE failed to start, degrading to poll on this borrow"
                );
                let conn = lease.conn()?;
                if conn.is_alive() {
                    let n = self.poll_cycle(&mailbox_id, lease, cancel).await?;
                    return Ok(TaskOutcome::DegradedToPoll {
                        new_messages: new_messages + n,
                    });
                }
                // Session died with the failed IDLE; nothing to degrade onto.
                return Err(e);
            }
        }

        while started.elapsed() < budget {
            let conn = lease.conn()?;
            let round = tokio::select! {
                r = conn.idle_round(startup, wait) => r?,
                _ = cancel.cancelled() => break,
            };
            match round {
                IdleOutcome::NewData => {
                    new_messages += self.poll_cycle(&mailbox_id, lease, cancel).await?;
                }
                // A timed-out round re-issues IDLE, which doubles as the
                // keepalive the server expects.
                IdleOutcome::Timeout => {}
                IdleOutcome::Interrupted => break,
            }
        }

        self.status
            .set_state(&mailbox_id, ConnState::Connected, None)?;
        Ok(TaskOutcome::IdleOk { new_messages })
    }
}
