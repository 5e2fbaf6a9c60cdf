//! Scheduler: one entry per active mailbox, a serial tick loop that emits
//! due tasks, and outcome handling that adapts interval, priority, and
//! IDLE enablement.
//!
//! The tick loop is the only writer of scheduling state; workers and the
//! pool talk to it through channels, observers get cloned snapshots.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::pool::hosts;
use crate::pool::PoolEvent;
use crate::types::{Mailbox, Priority, Task, TaskKind, VolumeTier};
use crate::workers::{ReportOutcome, TaskQueue, TaskReport};

use std::sync::Arc;

/// Cadence after a successful IDLE cycle.
const IDLE_OK_INTERVAL: Duration = Duration::from_secs(60);
/// First poll after IDLE gets disabled.
const IDLE_DISABLED_POLL_DELAY: Duration = Duration::from_secs(30);
/// IDLE retry backoff base and cap.
const IDLE_BACKOFF_BASE: Duration = Duration::from_secs(60);
const IDLE_BACKOFF_CAP: Duration = Duration::from_secs(300);
/// Poll failure backoff cap.
const FAILURE_BACKOFF_CAP: Duration = Duration::from_secs(300);
/// Quarantined mailboxes are probed at most this rarely.
const QUARANTINE_INTERVAL_CAP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct IdleFlags {
    pub supported: bool,
    pub enabled: bool,
    pub failures: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub mailbox: Mailbox,
    pub priority: Priority,
    /// Priority to restore when quarantine lifts.
    pub base_priority: Priority,
    pub interval: Duration,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    pub volume: VolumeTier,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub active: bool,
    pub quarantined: bool,
    pub idle: IdleFlags,
    /// True while a task for this entry is queued or running.
    pub pending: bool,
}

impl ScheduleEntry {
    fn new(mailbox: Mailbox, settings: &Settings, now: DateTime<Utc>) -> Self {
        let priority = mailbox.default_priority();
        let interval = settings.interval_for_priority(priority);
        // Smear the first service across the interval so a cold start does
        // not slam every host at once.
        let jitter_ms = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
        let canonical = hosts::canonical_host(&mailbox.imap_host);
        let idle_supported = hosts::idle_supported_by_default(&canonical);

        Self {
            mailbox,
            priority,
            base_priority: priority,
            interval,
            last_polled_at: None,
            next_poll_at: now + chrono::Duration::milliseconds(jitter_ms as i64),
            volume: match priority {
                Priority::High => VolumeTier::High,
                Priority::Medium => VolumeTier::Medium,
                Priority::Low => VolumeTier::Low,
            },
            success_rate: 1.0,
            consecutive_failures: 0,
            active: true,
            quarantined: false,
            idle: IdleFlags {
                supported: idle_supported,
                enabled: idle_supported,
                failures: 0,
                last_attempt_at: None,
            },
            pending: false,
        }
    }
}

/// Read-only view for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub mailbox_id: String,
    pub address: String,
    pub priority: Priority,
    pub interval_secs: u64,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    pub volume: VolumeTier,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub quarantined: bool,
    pub idle_supported: bool,
    pub idle_enabled: bool,
    pub idle_failures: u32,
    pub pending: bool,
}

pub struct Scheduler {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
    queue: Arc<TaskQueue>,
    settings: Arc<Settings>,
}

impl Scheduler {
    pub fn new(settings: Arc<Settings>, queue: Arc<TaskQueue>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            queue,
            settings,
        }
    }

    /// Reconcile the schedule against the store's active mailbox list:
    /// new mailboxes get entries, changed ones get their snapshot updated,
    /// vanished ones are removed (in-flight tasks finish but nothing new
    /// is emitted for them).
    pub fn sync_mailboxes(&self, mailboxes: Vec<Mailbox>) {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("schedule lock");

        let mut seen: Vec<&str> = Vec::with_capacity(mailboxes.len());
        for mailbox in &mailboxes {
            seen.push(mailbox.id.as_str());
        }
        let removed: Vec<String> = entries
            .keys()
            .filter(|id| !seen.contains(&id.as_str()))
            .cloned()
            .collect();
        for id in &removed {
            entries.remove(id);
            info!(mailbox_id = %id, "mailbox deactivated, schedule entry removed");
        }

        for mailbox in mailboxes {
            match entries.get_mut(&mailbox.id) {
                Some(entry) => {
                    let base = mailbox.default_priority();
                    if base != entry.base_priority {
                        entry.base_priority = base;
                        if !entry.quarantined {
                            entry.priority = base;
                        }
                    }
                    entry.mailbox = mailbox;
                }
                None => {
                    if entries.len() >= self.settings.max_concurrent_accounts {
                        warn!(
                            mailbox_id = %mailbox.id,
                            cap = self.settings.max_concurrent_accounts,
                            "account cap reached, mailbox not scheduled"
                        );
                        continue;
                    }
                    debug!(mailbox_id = %mailbox.id, "scheduling new mailbox");
                    entries.insert(
                        mailbox.id.clone(),
                        ScheduleEntry::new(mailbox, &self.settings, now),
                    );
                }
            }
        }
    }

    /// External priority override; takes effect on the next tick.
    pub fn set_priority(&self, mailbox_id: &str, priority: Priority) {
        let mut entries = self.entries.lock().expect("schedule lock");
        if let Some(entry) = entries.get_mut(mailbox_id) {
            entry.base_priority = priority;
            if !entry.quarantined {
                entry.priority = priority;
            }
        }
    }

    /// External IDLE switch. Re-enabling is only honored when the host
    /// supports IDLE; disabling always sticks.
    pub fn set_idle_enabled(&self, mailbox_id: &str, enabled: bool) {
        let mut entries = self.entries.lock().expect("schedule lock");
        if let Some(entry) = entries.get_mut(mailbox_id) {
            if enabled && entry.idle.supported {
                entry.idle.enabled = true;
                entry.idle.failures = 0;
            } else if !enabled {
                entry.idle.enabled = false;
            }
        }
    }

    /// A session died outside a task (liveness sweep); service the mailbox
    /// on the next tick.
    pub fn note_session_died(&self, mailbox_id: &str) {
        let mut entries = self.entries.lock().expect("schedule lock");
        if let Some(entry) = entries.get_mut(mailbox_id) {
            entry.next_poll_at = Utc::now();
        }
    }

    /// One scheduler pass: emit a task for every due entry.
    pub fn tick(&self) {
        let now = Utc::now();
        let due: Vec<Task> = {
            let mut entries = self.entries.lock().expect("schedule lock");
            let mut due = Vec::new();
            for entry in entries.values_mut() {
                if !entry.active || entry.pending || entry.next_poll_at > now {
                    continue;
                }
                let kind = due_kind(entry, now, &self.settings);
                if kind == TaskKind::Idle {
                    entry.idle.last_attempt_at = Some(now);
                }
                entry.pending = true;
                due.push(Task::new(
                    entry.mailbox.clone(),
                    entry.priority,
                    kind,
                    self.settings.task_max_retries,
                ));
            }
            due
        };

        for task in due {
            let mailbox_id = task.mailbox.id.clone();
            if let Err(e) = self.queue.push(task) {
                warn!(mailbox_id = %mailbox_id, error = %e, "task rejected by queue");
                let mut entries = self.entries.lock().expect("schedule lock");
                if let Some(entry) = entries.get_mut(&mailbox_id) {
                    // Retry on a later tick.
                    entry.pending = false;
                }
            }
        }
    }

    pub fn handle_report(&self, report: &TaskReport) {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("schedule lock");
        match entries.get_mut(&report.mailbox_id) {
            Some(entry) => apply_outcome(entry, &report.outcome, &self.settings, now),
            None => {
                // Entry removed while the task was in flight; nothing to do.
                debug!(mailbox_id = %report.mailbox_id, "report for unscheduled mailbox dropped");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ScheduleSnapshot> {
        let entries = self.entries.lock().expect("schedule lock");
        let mut out: Vec<ScheduleSnapshot> = entries
            .values()
            .map(|e| ScheduleSnapshot {
                mailbox_id: e.mailbox.id.clone(),
                address: e.mailbox.address.clone(),
                priority: e.priority,
                interval_secs: e.interval.as_secs(),
                last_polled_at: e.last_polled_at,
                next_poll_at: e.next_poll_at,
                volume: e.volume,
                success_rate: e.success_rate,
                consecutive_failures: e.consecutive_failures,
                quarantined: e.quarantined,
                idle_supported: e.idle.supported,
                idle_enabled: e.idle.enabled,
                idle_failures: e.idle.failures,
                pending: e.pending,
            })
            .collect();
        out.sort_by(|a, b| a.mailbox_id.cmp(&b.mailbox_id));
        out
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().expect("schedule lock").len()
    }

    /// The serial scheduler loop: tick on an interval, fold in worker
    /// reports and pool events as they arrive.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        reports: flume::Receiver<TaskReport>,
        pool_events: flume::Receiver<PoolEvent>,
    ) {
        let mut tick = tokio::time::interval(self.settings.scheduler_tick_interval);
        info!(
            tick_secs = self.settings.scheduler_tick_interval.as_secs(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick(),
                report = reports.recv_async() => match report {
                    Ok(report) => self.handle_report(&report),
                    Err(_) => {
                        debug!("worker report channel closed");
                        cancel.cancelled().await;
                        return;
                    }
                },
                event = pool_events.recv_async() => match event {
                    Ok(PoolEvent::SessionDied { mailbox_id }) => {
                        self.note_session_died(&mailbox_id);
                    }
                    Err(_) => {
                        debug!("pool event channel closed");
                        cancel.cancelled().await;
                        return;
                    }
                },
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
            }
        }
    }
}

/// Which task kind a due entry gets: IDLE when it is enabled, supported,
/// and either backing off from a failure or past the minimum retry gap.
fn due_kind(entry: &ScheduleEntry, now: DateTime<Utc>, settings: &Settings) -> TaskKind {
    if entry.idle.enabled && entry.idle.supported {
        let gap_ok = match entry.idle.last_attempt_at {
            Some(last) => {
                let since = now.signed_duration_since(last);
                since
                    >= chrono::Duration::from_std(settings.idle_retry_interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300))
            }
            None => true,
        };
        if gap_ok || entry.idle.failures > 0 {
            return TaskKind::Idle;
        }
    }
    TaskKind::Poll
}

fn schedule_in(entry: &mut ScheduleEntry, now: DateTime<Utc>, delay: Duration) {
    entry.next_poll_at =
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
}

fn apply_poll_success(
    entry: &mut ScheduleEntry,
    new_messages: u32,
    settings: &Settings,
    now: DateTime<Utc>,
) {
    entry.last_polled_at = Some(now);
    entry.consecutive_failures = 0;
    entry.success_rate = (entry.success_rate + 0.1).min(1.0);

    if entry.quarantined {
        entry.quarantined = false;
        entry.priority = entry.base_priority;
        info!(mailbox_id = %entry.mailbox.id, "mailbox recovered from quarantine");
    }

    let tier = VolumeTier::from_new_messages(new_messages);
    entry.volume = tier;
    entry.interval = settings.interval_for_volume(tier);
}

fn apply_failure(entry: &mut ScheduleEntry, settings: &Settings, now: DateTime<Utc>) {
    entry.consecutive_failures += 1;
    entry.success_rate = (entry.success_rate - 0.2).max(0.0);

    if entry.consecutive_failures >= settings.max_consecutive_failures {
        // Quarantine: double the interval (capped), demote, keep probing.
        entry.interval = (entry.interval * 2).min(QUARANTINE_INTERVAL_CAP);
        entry.priority = Priority::Low;
        if !entry.quarantined {
            entry.quarantined = true;
            warn!(
                mailbox_id = %entry.mailbox.id,
                failures = entry.consecutive_failures,
                interval_secs = entry.interval.as_secs(),
                "mailbox quarantined"
            );
        }
        schedule_in(entry, now, entry.interval);
    } else {
        let factor = settings
            .backoff_multiplier
            .powi(entry.consecutive_failures as i32);
        let backoff = entry.interval.mul_f64(factor).min(FAILURE_BACKOFF_CAP);
        schedule_in(entry, now, backoff);
    }
}

fn apply_idle_failure(entry: &mut ScheduleEntry, settings: &Settings, now: DateTime<Utc>) {
    entry.idle.failures += 1;
    if entry.idle.failures >= settings.max_idle_failures {
        entry.idle.enabled = false;
        info!(
            mailbox_id = %entry.mailbox.id,
            failures = entry.idle.failures,
            "IDLE disabled after repeated failures, falling back to polling"
        );
        schedule_in(entry, now, IDLE_DISABLED_POLL_DELAY);
    } else {
        let backoff = IDLE_BACKOFF_BASE * 2u32.saturating_pow(entry.idle.failures);
        schedule_in(entry, now, backoff.min(IDLE_BACKOFF_CAP));
    }
}

pub(crate) fn apply_outcome(
    entry: &mut ScheduleEntry,
    outcome: &ReportOutcome,
    settings: &Settings,
    now: DateTime<Utc>,
) {
    entry.pending = false;
    match outcome {
        ReportOutcome::PollOk {
            new_messages,
            supports_idle,
        } => {
            if !supports_idle && entry.idle.supported {
                // The live capability probe beats the host default; the
                // enabled flag follows so the invariant holds.
                entry.idle.supported = false;
                entry.idle.enabled = false;
            } else if *supports_idle {
                entry.idle.supported = true;
            }
            apply_poll_success(entry, *new_messages, settings, now);
            schedule_in(entry, now, entry.interval);
        }
        ReportOutcome::PollFailed { auth, .. } => {
            if *auth {
                entry.priority = Priority::Low;
            }
            apply_failure(entry, settings, now);
        }
        ReportOutcome::IdleOk { new_messages } => {
            entry.idle.failures = 0;
            apply_poll_success(entry, *new_messages, settings, now);
            schedule_in(entry, now, IDLE_OK_INTERVAL);
        }
        ReportOutcome::IdleFailed { .. } => {
            apply_idle_failure(entry, settings, now);
        }
        ReportOutcome::DegradedToPoll { new_messages } => {
            // The poll half succeeded on the same borrow; the IDLE half
            // still counts against the IDLE budget.
            apply_poll_success(entry, *new_messages, settings, now);
            apply_idle_failure(entry, settings, now);
        }
        ReportOutcome::HealthOk => {
            schedule_in(entry, now, entry.interval);
        }
        ReportOutcome::HealthFailed { .. } => {
            apply_failure(entry, settings, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::mailboxes::tests::sample_mailbox;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn entry(settings: &Settings) -> ScheduleEntry {
        ScheduleEntry::new(sample_mailbox("mb-1"), settings, Utc::now())
    }

    fn poll_ok(n: u32) -> ReportOutcome {
        ReportOutcome::PollOk {
            new_messages: n,
            supports_idle: true,
        }
    }

    fn poll_failed() -> ReportOutcome {
        ReportOutcome::PollFailed {
            error: "socket reset".into(),
            auth: false,
        }
    }

    #[test]
    fn test_poll_success_resets_failures_and_bumps_rate() {
        let s = settings();
        let mut e = entry(&s);
        e.consecutive_failures = 2;
        e.success_rate = 0.5;

        apply_outcome(&mut e, &poll_ok(0), &s, Utc::now());
        assert_eq!(e.consecutive_failures, 0);
        assert!((e.success_rate - 0.6).abs() < 1e-9);
        assert!(e.last_polled_at.is_some());
    }

    #[test]
    fn test_success_rate_caps_at_one() {
        let s = settings();
        let mut e = entry(&s);
        e.success_rate = 0.95;
        apply_outcome(&mut e, &poll_ok(0), &s, Utc::now());
        assert_eq!(e.success_rate, 1.0);
    }

    #[test]
    fn test_three_failures_quarantine_demotes_and_doubles_interval() {
        let s = settings();
        let mut e = entry(&s);
        e.priority = Priority::High;
        e.base_priority = Priority::High;
        e.interval = Duration::from_secs(60);

        let now = Utc::now();
        apply_outcome(&mut e, &poll_failed(), &s, now);
        apply_outcome(&mut e, &poll_failed(), &s, now);
        assert!(!e.quarantined);
        apply_outcome(&mut e, &poll_failed(), &s, now);

        assert!(e.quarantined);
        assert_eq!(e.priority, Priority::Low);
        assert_eq!(e.interval, Duration::from_secs(120));

        // Next success restores the base priority and clears the count.
        apply_outcome(&mut e, &poll_ok(0), &s, now);
        assert!(!e.quarantined);
        assert_eq!(e.priority, Priority::High);
        assert_eq!(e.consecutive_failures, 0);
    }

    #[test]
    fn test_quarantine_interval_caps_at_one_hour() {
        let s = settings();
        let mut e = entry(&s);
        e.interval = Duration::from_secs(3000);
        for _ in 0..5 {
            apply_outcome(&mut e, &poll_failed(), &s, Utc::now());
        }
        assert_eq!(e.interval, QUARANTINE_INTERVAL_CAP);
    }

    #[test]
    fn test_failure_backoff_caps_at_five_minutes() {
        let s = settings();
        let mut e = entry(&s);
        e.interval = Duration::from_secs(240);

        let now = Utc::now();
        apply_outcome(&mut e, &poll_failed(), &s, now);
        // 240s * 2 = 480s, capped at 300s
        let delta = e.next_poll_at.signed_duration_since(now);
        assert_eq!(delta.num_seconds(), 300);
    }

    #[test]
    fn test_three_idle_failures_disable_idle() {
        let s = settings();
        let mut e = entry(&s);
        assert!(e.idle.enabled);

        let now = Utc::now();
        apply_outcome(&mut e, &ReportOutcome::IdleFailed { error: "drop".into() }, &s, now);
        assert!(e.idle.enabled);
        assert_eq!(e.idle.failures, 1);
        apply_outcome(&mut e, &ReportOutcome::IdleFailed { error: "drop".into() }, &s, now);
        assert!(e.idle.enabled);
        apply_outcome(&mut e, &ReportOutcome::IdleFailed { error: "drop".into() }, &s, now);

        assert!(!e.idle.enabled);
        assert_eq!(e.idle.failures, 3);
        // Poll is scheduled shortly after the disable.
        let delta = e.next_poll_at.signed_duration_since(now);
        assert_eq!(delta.num_seconds(), 30);
        // And the next due kind is a poll, not another IDLE.
        assert_eq!(due_kind(&e, now, &s), TaskKind::Poll);
    }

    #[test]
    fn test_idle_does_not_reenable_on_success_after_disable() {
        let s = settings();
        let mut e = entry(&s);
        e.idle.enabled = false;
        e.idle.failures = 3;

        apply_outcome(&mut e, &poll_ok(5), &s, Utc::now());
        assert!(!e.idle.enabled);

        // Only the explicit external command re-enables.
        let scheduler = Scheduler::new(settings(), Arc::new(TaskQueue::new(10)));
        scheduler.sync_mailboxes(vec![sample_mailbox("mb-1")]);
        {
            let mut entries = scheduler.entries.lock().unwrap();
            let entry = entries.get_mut("mb-1").unwrap();
            entry.idle.enabled = false;
            entry.idle.failures = 3;
        }
        scheduler.set_idle_enabled("mb-1", true);
        let snap = scheduler.snapshot();
        assert!(snap[0].idle_enabled);
        assert_eq!(snap[0].idle_failures, 0);
    }

    #[test]
    fn test_capability_probe_overrides_host_default() {
        let s = settings();
        let mut e = entry(&s);
        assert!(e.idle.supported);

        let outcome = ReportOutcome::PollOk {
            new_messages: 0,
            supports_idle: false,
        };
        apply_outcome(&mut e, &outcome, &s, Utc::now());
        assert!(!e.idle.supported);
        assert!(!e.idle.enabled);
    }

    #[test]
    fn test_volume_adaptation_changes_interval() {
        let s = settings();
        let mut e = entry(&s);

        apply_outcome(&mut e, &poll_ok(150), &s, Utc::now());
        assert_eq!(e.volume, VolumeTier::High);
        assert_eq!(e.interval, Duration::from_secs(60));

        apply_outcome(&mut e, &poll_ok(50), &s, Utc::now());
        assert_eq!(e.volume, VolumeTier::Medium);
        assert_eq!(e.interval, Duration::from_secs(300));

        apply_outcome(&mut e, &poll_ok(2), &s, Utc::now());
        assert_eq!(e.volume, VolumeTier::Low);
        assert_eq!(e.interval, Duration::from_secs(900));
    }

    #[test]
    fn test_degraded_counts_both_ways() {
        let s = settings();
        let mut e = entry(&s);
        e.consecutive_failures = 1;

        apply_outcome(
            &mut e,
            &ReportOutcome::DegradedToPoll { new_messages: 3 },
            &s,
            Utc::now(),
        );
        // Poll half: failures reset; IDLE half: one failure recorded.
        assert_eq!(e.consecutive_failures, 0);
        assert_eq!(e.idle.failures, 1);
        assert!(e.idle.enabled);
    }

    #[test]
    fn test_auth_failure_demotes_immediately() {
        let s = settings();
        let mut e = entry(&s);
        e.priority = Priority::High;

        let outcome = ReportOutcome::PollFailed {
            error: "LOGIN rejected".into(),
            auth: true,
        };
        apply_outcome(&mut e, &outcome, &s, Utc::now());
        assert_eq!(e.priority, Priority::Low);
    }

    #[test]
    fn test_tick_emits_only_due_active_entries() {
        let queue = Arc::new(TaskQueue::new(100));
        let scheduler = Scheduler::new(settings(), queue.clone());
        scheduler.sync_mailboxes(vec![sample_mailbox("mb-1"), sample_mailbox("mb-2")]);

        {
            let mut entries = scheduler.entries.lock().unwrap();
            // mb-1 is overdue, mb-2 far in the future
            entries.get_mut("mb-1").unwrap().next_poll_at = Utc::now() - chrono::Duration::seconds(5);
            entries.get_mut("mb-2").unwrap().next_poll_at = Utc::now() + chrono::Duration::hours(1);
        }

        scheduler.tick();
        let task = queue.pop().expect("one task due");
        assert_eq!(task.mailbox.id, "mb-1");
        assert!(queue.pop().is_none());

        // Entry is pending; a second tick must not double-emit.
        scheduler.tick();
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_removed_mailbox_is_never_emitted() {
        let queue = Arc::new(TaskQueue::new(100));
        let scheduler = Scheduler::new(settings(), queue.clone());
        scheduler.sync_mailboxes(vec![sample_mailbox("mb-1")]);
        {
            let mut entries = scheduler.entries.lock().unwrap();
            entries.get_mut("mb-1").unwrap().next_poll_at = Utc::now() - chrono::Duration::seconds(5);
        }

        // Deactivation: the store stops returning it.
        scheduler.sync_mailboxes(vec![]);
        scheduler.tick();
        assert!(queue.pop().is_none());
        assert_eq!(scheduler.entry_count(), 0);

        // A late report for the removed mailbox is dropped quietly.
        scheduler.handle_report(&TaskReport {
            mailbox_id: "mb-1".into(),
            kind: TaskKind::Poll,
            priority: Priority::Low,
            outcome: poll_ok(1),
        });
    }

    #[test]
    fn test_due_kind_prefers_idle_within_gate() {
        let s = settings();
        let mut e = entry(&s);
        let now = Utc::now();

        // Never attempted: IDLE goes first.
        assert_eq!(due_kind(&e, now, &s), TaskKind::Idle);

        // Recent attempt without failures: fall back to poll.
        e.idle.last_attempt_at = Some(now - chrono::Duration::seconds(30));
        assert_eq!(due_kind(&e, now, &s), TaskKind::Poll);

        // Backing off from a failure: IDLE retries regardless of the gap.
        e.idle.failures = 1;
        assert_eq!(due_kind(&e, now, &s), TaskKind::Idle);

        // Old attempt: gate reopens.
        e.idle.failures = 0;
        e.idle.last_attempt_at = Some(now - chrono::Duration::seconds(600));
        assert_eq!(due_kind(&e, now, &s), TaskKind::Idle);

        e.idle.enabled = false;
        assert_eq!(due_kind(&e, now, &s), TaskKind::Poll);
    }

    #[test]
    fn test_session_death_pulls_service_forward() {
        let queue = Arc::new(TaskQueue::new(100));
        let scheduler = Scheduler::new(settings(), queue.clone());
        scheduler.sync_mailboxes(vec![sample_mailbox("mb-1")]);
        {
            let mut entries = scheduler.entries.lock().unwrap();
            entries.get_mut("mb-1").unwrap().next_poll_at = Utc::now() + chrono::Duration::hours(1);
        }

        scheduler.note_session_died("mb-1");
        scheduler.tick();
        assert!(queue.pop().is_some());
    }

    #[test]
    fn test_account_cap_limits_schedule() {
        let s = Arc::new(Settings {
            max_concurrent_accounts: 2,
            ..Settings::default()
        });
        let scheduler = Scheduler::new(s, Arc::new(TaskQueue::new(10)));
        scheduler.sync_mailboxes(vec![
            sample_mailbox("mb-1"),
            sample_mailbox("mb-2"),
            sample_mailbox("mb-3"),
        ]);
        assert_eq!(scheduler.entry_count(), 2);
    }
}
