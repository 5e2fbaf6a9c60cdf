//! Connection pool: owns live IMAP sessions, groups them by canonical
//! server host, and enforces per-host concurrency and rate caps.
//!
//! A worker borrows a mailbox's session through `acquire` and must hand it
//! back with `release` or `discard`; the borrow is exclusive per mailbox,
//! which is what serializes all IMAP work on a given account. Dropping a
//! lease without releasing (the cancellation path) frees the slot
//! synchronously so the mailbox can reconnect.

pub mod hosts;

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::imap::{self, ImapConnection};
use crate::adapters::sqlite::{Counter, StatusStore};
use crate::config::Settings;
use crate::types::{ConnState, IngestError, Mailbox, Priority};

/// Session creation retries.
const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const CREATE_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Cached sessions idle longer than this are closed by the purge pass.
const IDLE_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Events the pool reports upward; the scheduler pulls affected mailboxes
/// forward on its next tick.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    SessionDied { mailbox_id: String },
}

/// Wait-queue key: highest priority first, FIFO within a tier.
type WaiterKey = (Reverse<Priority>, u64);

type WaiterQueue = BTreeMap<WaiterKey, Arc<Notify>>;

/// Which event a parked acquire is waiting for. Same-mailbox borrow waits
/// are keyed to that mailbox's slot; capacity and rate waits are keyed to
/// the host, since only those unblock on host-level events.
#[derive(Clone, Copy)]
enum WaitOn {
    Host,
    Slot,
}

fn park_waiter(waiters: &mut WaiterQueue, priority: Priority, seq: u64) -> (WaiterKey, Arc<Notify>) {
    let key = (Reverse(priority), seq);
    let notify = Arc::new(Notify::new());
    waiters.insert(key, notify.clone());
    (key, notify)
}

/// Signal the best waiter without removing it; the waiter re-checks its
/// condition itself and drops its entry when it stops waiting.
fn wake_first(waiters: &WaiterQueue) {
    if let Some((_, notify)) = waiters.iter().next() {
        notify.notify_one();
    }
}

enum Admission {
    Grant,
    AtCapacity,
    RateLimited { retry_at: Instant },
}

struct HostGroup {
    max_sessions: usize,
    rate_limit: usize,
    rate_window: Duration,
    live: usize,
    /// Creation instants inside the rolling window.
    window: VecDeque<Instant>,
    /// Acquires parked on host capacity or the rate window. Borrow waits
    /// live on the mailbox's slot instead, so a session release never
    /// gets absorbed by an unrelated capacity waiter.
    waiters: WaiterQueue,
}

impl HostGroup {
    fn new(settings: &Settings) -> Self {
        Self {
            max_sessions: settings.max_connections_per_server,
            rate_limit: settings.max_rate_limit,
            rate_window: settings.rate_limit_window,
            live: 0,
            window: VecDeque::new(),
            waiters: BTreeMap::new(),
        }
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if now.duration_since(front) >= self.rate_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn admission(&mut self, now: Instant) -> Admission {
        self.prune_window(now);
        if self.live >= self.max_sessions {
            return Admission::AtCapacity;
        }
        if self.window.len() >= self.rate_limit {
            let retry_at = self
                .window
                .front()
                .map(|&t| t + self.rate_window)
                .unwrap_or(now);
            return Admission::RateLimited { retry_at };
        }
        Admission::Grant
    }

    fn grant(&mut self, now: Instant) {
        self.live += 1;
        self.window.push_back(now);
    }

    fn park(&mut self, priority: Priority, seq: u64) -> (WaiterKey, Arc<Notify>) {
        park_waiter(&mut self.waiters, priority, seq)
    }

    fn unpark(&mut self, key: &WaiterKey) {
        self.waiters.remove(key);
    }

    fn wake_next(&self) {
        wake_first(&self.waiters);
    }
}

struct SessionSlot {
    host_key: String,
    /// `None` while a lease holds the connection.
    conn: Option<ImapConnection>,
    last_used: Instant,
    /// Acquires waiting for this mailbox's borrow to come back. A release
    /// wakes these; host-level events wake the host queue.
    waiters: WaiterQueue,
}

struct PoolInner {
    sessions: HashMap<String, SessionSlot>,
    hosts: HashMap<String, HostGroup>,
    waiter_seq: u64,
}

impl PoolInner {
    fn group_mut(&mut self, host_key: &str, settings: &Settings) -> &mut HostGroup {
        self.hosts
            .entry(host_key.to_string())
            .or_insert_with(|| HostGroup::new(settings))
    }

    fn next_seq(&mut self) -> u64 {
        self.waiter_seq += 1;
        self.waiter_seq
    }
}

/// Shared with leases so the cancellation path can free its slot without
/// the full pool.
struct PoolCore {
    inner: Mutex<PoolInner>,
    settings: Arc<Settings>,
}

impl PoolCore {
    fn remove_slot(&self, mailbox_id: &str) {
        let mut inner = self.inner.lock().expect("pool lock");
        if let Some(slot) = inner.sessions.remove(mailbox_id) {
            // Borrow-waiters lose their slot; wake them all so they retry
            // through admission and create a fresh session.
            for notify in slot.waiters.values() {
                notify.notify_one();
            }
            if let Some(group) = inner.hosts.get_mut(&slot.host_key) {
                group.live = group.live.saturating_sub(1);
                group.wake_next();
            }
        }
    }
}

/// An exclusive borrow of one mailbox's session.
pub struct SessionLease {
    mailbox_id: String,
    conn: Option<ImapConnection>,
    core: Arc<PoolCore>,
}

impl SessionLease {
    pub fn mailbox_id(&self) -> &str {
        &self.mailbox_id
    }

    pub fn conn(&mut self) -> Result<&mut ImapConnection, IngestError> {
        self.conn
            .as_mut()
            .ok_or_else(|| IngestError::NoSession(self.mailbox_id.clone()))
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            // Dropped without explicit release: the task was cancelled
            // mid-flight. Free the slot; the TCP stream closes with the
            // connection value.
            self.core.remove_slot(&self.mailbox_id);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub host: String,
    pub live_sessions: usize,
    pub max_sessions: usize,
    pub window_used: usize,
    pub rate_limit: usize,
    pub waiters: usize,
}

pub struct ConnectionPool {
    core: Arc<PoolCore>,
    status: Arc<StatusStore>,
    events: flume::Sender<PoolEvent>,
}

impl ConnectionPool {
    pub fn new(
        settings: Arc<Settings>,
        status: Arc<StatusStore>,
    ) -> (Self, flume::Receiver<PoolEvent>) {
        let (events, events_rx) = flume::unbounded();
        let pool = Self {
            core: Arc::new(PoolCore {
                inner: Mutex::new(PoolInner {
                    sessions: HashMap::new(),
                    hosts: HashMap::new(),
                    waiter_seq: 0,
                }),
                settings,
            }),
            status,
            events,
        };
        (pool, events_rx)
    }

    /// Borrow a live session for the mailbox, creating one if host capacity
    /// and rate allow. Parks in a priority-ordered wait queue otherwise;
    /// yields `Busy` once the priority-derived deadline passes.
    pub async fn acquire(
        &self,
        mailbox: &Mailbox,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, IngestError> {
        let host_key = hosts::canonical_host(&mailbox.imap_host);
        let deadline = Instant::now() + priority.acquire_timeout();

        enum Step {
            Probe(ImapConnection),
            Create,
            Wait {
                key: WaiterKey,
                notify: Arc<Notify>,
                retry_at: Option<Instant>,
                on: WaitOn,
            },
        }

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let step = {
                let settings = self.core.settings.clone();
                let mut inner = self.core.inner.lock().expect("pool lock");
                let now = Instant::now();
                let seq = inner.next_seq();

                enum SlotState {
                    Available(ImapConnection),
                    Borrowed(WaiterKey, Arc<Notify>),
                    Missing,
                }

                let slot_state = match inner.sessions.get_mut(&mailbox.id) {
                    Some(slot) => match slot.conn.take() {
                        Some(conn) => {
                            slot.last_used = now;
                            SlotState::Available(conn)
                        }
                        None => {
                            // Same-mailbox contention: wait on the slot so
                            // the holder's release reaches us directly.
                            let (key, notify) = park_waiter(&mut slot.waiters, priority, seq);
                            SlotState::Borrowed(key, notify)
                        }
                    },
                    None => SlotState::Missing,
                };

                match slot_state {
                    SlotState::Available(conn) => Step::Probe(conn),
                    SlotState::Borrowed(key, notify) => Step::Wait {
                        key,
                        notify,
                        retry_at: None,
                        on: WaitOn::Slot,
                    },
                    SlotState::Missing => {
                        let group = inner.group_mut(&host_key, &settings);
                        match group.admission(now) {
                            Admission::Grant => {
                                group.grant(now);
                                inner.sessions.insert(
                                    mailbox.id.clone(),
                                    SessionSlot {
                                        host_key: host_key.clone(),
                                        conn: None,
                                        last_used: now,
                                        waiters: WaiterQueue::new(),
                                    },
                                );
                                Step::Create
                            }
                            Admission::AtCapacity => {
                                let (key, notify) = group.park(priority, seq);
                                Step::Wait {
                                    key,
                                    notify,
                                    retry_at: None,
                                    on: WaitOn::Host,
                                }
                            }
                            Admission::RateLimited { retry_at } => {
                                let (key, notify) = group.park(priority, seq);
                                Step::Wait {
                                    key,
                                    notify,
                                    retry_at: Some(retry_at),
                                    on: WaitOn::Host,
                                }
                            }
                        }
                    }
                }
            };

            match step {
                Step::Probe(mut conn) => match conn.noop().await {
                    Ok(()) => {
                        return Ok(SessionLease {
                            mailbox_id: mailbox.id.clone(),
                            conn: Some(conn),
                            core: self.core.clone(),
                        })
                    }
                    Err(e) => {
                        debug!(
                            mailbox_id = %mailbox.id,
                            error = %e,
                            "cached session failed liveness probe, recreating"
                        );
                        conn.logout().await;
                        self.core.remove_slot(&mailbox.id);
                        let _ = self
                            .status
                            .set_state(&mailbox.id, ConnState::Disconnected, None);
                        continue;
                    }
                },
                Step::Create => match self.create_session(mailbox).await {
                    Ok(conn) => {
                        let _ = self.status.set_state(&mailbox.id, ConnState::Connected, None);
                        return Ok(SessionLease {
                            mailbox_id: mailbox.id.clone(),
                            conn: Some(conn),
                            core: self.core.clone(),
                        });
                    }
                    Err(e) => {
                        self.core.remove_slot(&mailbox.id);
                        let _ = self.status.set_state(
                            &mailbox.id,
                            ConnState::Error,
                            Some(&e.to_string()),
                        );
                        let _ = self.status.increment(&mailbox.id, Counter::Failures, 1);
                        return Err(e);
                    }
                },
                Step::Wait {
                    key,
                    notify,
                    retry_at,
                    on,
                } => {
                    let now = Instant::now();
                    let wake_at = retry_at.map(|t| t.min(deadline)).unwrap_or(deadline);
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at.max(now))) => {}
                        _ = cancel.cancelled() => {
                            self.unpark(&host_key, &mailbox.id, on, &key, true);
                            return Err(IngestError::Cancelled);
                        }
                    }
                    self.unpark(&host_key, &mailbox.id, on, &key, false);
                    if Instant::now() >= deadline {
                        // A signal we absorbed goes to the next in line.
                        self.wake_waiting(&host_key, &mailbox.id, on);
                        return Err(IngestError::Busy(host_key));
                    }
                }
            }
        }
    }

    /// Hand a healthy session back; it stays cached for the next task.
    pub async fn release(&self, mut lease: SessionLease) {
        if let Some(conn) = lease.conn.take() {
            if conn.is_alive() {
                if let Some(leftover) = self.return_to_slot(&lease.mailbox_id, conn) {
                    // Slot vanished while borrowed (purge or deactivation).
                    leftover.logout().await;
                }
            } else {
                self.core.remove_slot(&lease.mailbox_id);
                let _ = self
                    .status
                    .set_state(&lease.mailbox_id, ConnState::Disconnected, None);
            }
        }
    }

    /// Close the session and drop the slot; the next acquire reconnects.
    pub async fn discard(&self, mut lease: SessionLease) {
        let mailbox_id = lease.mailbox_id.clone();
        if let Some(conn) = lease.conn.take() {
            conn.logout().await;
        }
        self.core.remove_slot(&mailbox_id);
        let _ = self
            .status
            .set_state(&mailbox_id, ConnState::Disconnected, None);
    }

    fn return_to_slot(
        &self,
        mailbox_id: &str,
        conn: ImapConnection,
    ) -> Option<ImapConnection> {
        let mut inner = self.core.inner.lock().expect("pool lock");
        match inner.sessions.get_mut(mailbox_id) {
            Some(slot) => {
                slot.conn = Some(conn);
                slot.last_used = Instant::now();
                // The borrow came back; host capacity did not change, so
                // only this mailbox's waiters have anything to do.
                wake_first(&slot.waiters);
                None
            }
            None => Some(conn),
        }
    }

    fn wake_waiting(&self, host_key: &str, mailbox_id: &str, on: WaitOn) {
        let inner = self.core.inner.lock().expect("pool lock");
        match on {
            WaitOn::Host => {
                if let Some(group) = inner.hosts.get(host_key) {
                    group.wake_next();
                }
            }
            WaitOn::Slot => {
                if let Some(slot) = inner.sessions.get(mailbox_id) {
                    wake_first(&slot.waiters);
                }
            }
        }
    }

    fn unpark(
        &self,
        host_key: &str,
        mailbox_id: &str,
        on: WaitOn,
        key: &WaiterKey,
        wake_next: bool,
    ) {
        let mut inner = self.core.inner.lock().expect("pool lock");
        match on {
            WaitOn::Host => {
                if let Some(group) = inner.hosts.get_mut(host_key) {
                    group.unpark(key);
                    if wake_next {
                        group.wake_next();
                    }
                }
            }
            WaitOn::Slot => {
                if let Some(slot) = inner.sessions.get_mut(mailbox_id) {
                    slot.waiters.remove(key);
                    if wake_next {
                        wake_first(&slot.waiters);
                    }
                }
            }
        }
    }

    async fn create_session(&self, mailbox: &Mailbox) -> Result<ImapConnection, IngestError> {
        let _ = self
            .status
            .set_state(&mailbox.id, ConnState::Connecting, None);

        let mut delay = CREATE_BACKOFF_BASE;
        let mut last_err = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            let _ = self.status.increment(&mailbox.id, Counter::Attempts, 1);
            match imap::connect(mailbox).await {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(mailbox_id = %mailbox.id, attempt, "session created after retry");
                    }
                    return Ok(conn);
                }
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => {
                    warn!(
                        mailbox_id = %mailbox.id,
                        attempt,
                        error = %e,
                        "session creation failed"
                    );
                    last_err = Some(e);
                    if attempt < CREATE_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(CREATE_BACKOFF_CAP);
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| IngestError::Network("session creation failed".into())))
    }

    /// Liveness sweep: probe every cached session, close the dead ones, and
    /// mark their mailboxes for reconnection.
    pub async fn sweep_once(&self) {
        let targets: Vec<(String, ImapConnection)> = {
            let mut inner = self.core.inner.lock().expect("pool lock");
            inner
                .sessions
                .iter_mut()
                .filter_map(|(id, slot)| slot.conn.take().map(|c| (id.clone(), c)))
                .collect()
        };

        let mut dead = 0usize;
        let total = targets.len();
        for (mailbox_id, mut conn) in targets {
            match conn.noop().await {
                Ok(()) => {
                    if let Some(leftover) = self.return_to_slot(&mailbox_id, conn) {
                        leftover.logout().await;
                    }
                }
                Err(e) => {
                    dead += 1;
                    info!(mailbox_id = %mailbox_id, error = %e, "sweep found dead session");
                    conn.logout().await;
                    self.core.remove_slot(&mailbox_id);
                    let _ = self
                        .status
                        .set_state(&mailbox_id, ConnState::Reconnecting, None);
                    let _ = self.events.send(PoolEvent::SessionDied { mailbox_id });
                }
            }
        }
        if total > 0 {
            debug!(total, dead, "liveness sweep complete");
        }
    }

    /// Purge pass: close sessions idle past the TTL and drop bookkeeping
    /// for host groups with nothing left in them.
    pub async fn purge_once(&self) {
        let stale: Vec<(String, ImapConnection)> = {
            let mut inner = self.core.inner.lock().expect("pool lock");
            let now = Instant::now();
            inner
                .sessions
                .iter_mut()
                .filter(|(_, slot)| {
                    slot.conn.is_some() && now.duration_since(slot.last_used) > IDLE_SESSION_TTL
                })
                .filter_map(|(id, slot)| slot.conn.take().map(|c| (id.clone(), c)))
                .collect()
        };

        for (mailbox_id, conn) in stale {
            debug!(mailbox_id = %mailbox_id, "closing idle session past TTL");
            conn.logout().await;
            self.core.remove_slot(&mailbox_id);
            let _ = self
                .status
                .set_state(&mailbox_id, ConnState::Disconnected, None);
        }

        let mut inner = self.core.inner.lock().expect("pool lock");
        let now = Instant::now();
        for group in inner.hosts.values_mut() {
            group.prune_window(now);
        }
        inner
            .hosts
            .retain(|_, g| g.live > 0 || !g.waiters.is_empty() || !g.window.is_empty());
    }

    /// Background sweeps; runs until cancelled.
    pub async fn run_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let sweep_every = self.core.settings.pool_sweep_interval;
        let purge_every = self.core.settings.pool_purge_interval;
        let mut sweep = tokio::time::interval(sweep_every);
        let mut purge = tokio::time::interval(purge_every);
        // The first tick of a tokio interval fires immediately.
        sweep.tick().await;
        purge.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep_once().await,
                _ = purge.tick() => self.purge_once().await,
                _ = cancel.cancelled() => {
                    debug!("pool maintenance stopping");
                    return;
                }
            }
        }
    }

    /// Log out every cached session. Used on shutdown.
    pub async fn close_all(&self) {
        let conns: Vec<(String, ImapConnection)> = {
            let mut inner = self.core.inner.lock().expect("pool lock");
            let drained: Vec<_> = inner
                .sessions
                .iter_mut()
                .filter_map(|(id, slot)| slot.conn.take().map(|c| (id.clone(), c)))
                .collect();
            // Anything still parked rechecks and exits on its cancel token.
            for slot in inner.sessions.values() {
                for notify in slot.waiters.values() {
                    notify.notify_one();
                }
            }
            inner.sessions.clear();
            inner.hosts.clear();
            drained
        };
        info!(count = conns.len(), "closing all pooled sessions");
        for (mailbox_id, conn) in conns {
            conn.logout().await;
            let _ = self
                .status
                .set_state(&mailbox_id, ConnState::Disconnected, None);
        }
    }

    pub fn total_live(&self) -> usize {
        let inner = self.core.inner.lock().expect("pool lock");
        inner.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        let inner = self.core.inner.lock().expect("pool lock");
        let mut hosts: Vec<HostSnapshot> = inner
            .hosts
            .iter()
            .map(|(host, g)| HostSnapshot {
                host: host.clone(),
                live_sessions: g.live,
                max_sessions: g.max_sessions,
                window_used: g.window.len(),
                rate_limit: g.rate_limit,
                waiters: g.waiters.len(),
            })
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            max_connections_per_server: 2,
            max_rate_limit: 3,
            rate_limit_window: Duration::from_secs(60),
            ..Settings::default()
        }
    }

    #[test]
    fn test_admission_grants_until_capacity() {
        let s = settings();
        let mut group = HostGroup::new(&s);
        let now = Instant::now();

        assert!(matches!(group.admission(now), Admission::Grant));
        group.grant(now);
        assert!(matches!(group.admission(now), Admission::Grant));
        group.grant(now);
        assert!(matches!(group.admission(now), Admission::AtCapacity));
    }

    #[test]
    fn test_admission_rate_limits_within_window() {
        let s = Settings {
            max_connections_per_server: 100,
            max_rate_limit: 2,
            rate_limit_window: Duration::from_secs(60),
            ..Settings::default()
        };
        let mut group = HostGroup::new(&s);
        let now = Instant::now();

        group.grant(now);
        group.grant(now);
        // Capacity remains but the window is exhausted.
        match group.admission(now) {
            Admission::RateLimited { retry_at } => {
                assert!(retry_at > now);
            }
            other => panic!("expected RateLimited, got {:?}", discriminant_name(&other)),
        }
    }

    #[test]
    fn test_window_rolls_over() {
        let s = Settings {
            max_connections_per_server: 100,
            max_rate_limit: 1,
            rate_limit_window: Duration::from_millis(10),
            ..Settings::default()
        };
        let mut group = HostGroup::new(&s);
        let start = Instant::now();
        group.grant(start);
        assert!(matches!(
            group.admission(start),
            Admission::RateLimited { .. }
        ));
        // After the window passes, the same group admits again.
        let later = start + Duration::from_millis(20);
        assert!(matches!(group.admission(later), Admission::Grant));
        assert!(group.window.is_empty());
    }

    fn test_pool_with_capacity(max_sessions: usize) -> ConnectionPool {
        let settings = Arc::new(Settings {
            max_connections_per_server: max_sessions,
            ..Settings::default()
        });
        let status = Arc::new(StatusStore::new(
            crate::adapters::sqlite::mailboxes::tests::test_pool(),
        ));
        ConnectionPool::new(settings, status).0
    }

    /// Host at capacity: mailbox A's single session is borrowed out, one
    /// waiter is stuck on host capacity for another mailbox, and one is
    /// parked on mailbox A's borrow.
    fn contended_setup(pool: &ConnectionPool) -> (Arc<Notify>, Arc<Notify>) {
        let settings = pool.core.settings.clone();
        let mut inner = pool.core.inner.lock().expect("pool lock");
        let now = Instant::now();

        let group = inner.group_mut("imap.example.org", &settings);
        group.grant(now);
        let (_, host_waiter) = group.park(Priority::High, 1);

        inner.sessions.insert(
            "mb-a".into(),
            SessionSlot {
                host_key: "imap.example.org".into(),
                conn: None,
                last_used: now,
                waiters: WaiterQueue::new(),
            },
        );
        let slot = inner.sessions.get_mut("mb-a").expect("slot just inserted");
        let (_, borrow_waiter) = park_waiter(&mut slot.waiters, Priority::High, 2);

        (host_waiter, borrow_waiter)
    }

    #[tokio::test]
    async fn test_release_wakes_borrow_waiter_not_host_queue() {
        let pool = test_pool_with_capacity(1);
        let (host_waiter, borrow_waiter) = contended_setup(&pool);

        // Mailbox A's borrow comes back: its own waiter must be signalled
        // even though an earlier, higher-placed capacity waiter exists.
        let leftover = pool.return_to_slot("mb-a", ImapConnection::stub("imap.example.org"));
        assert!(leftover.is_none());
        tokio::time::timeout(Duration::from_millis(50), borrow_waiter.notified())
            .await
            .expect("borrow waiter woken on release");

        // The capacity queue stays parked: live count did not change.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), host_waiter.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_slot_removal_wakes_borrow_waiters_and_capacity_queue() {
        let pool = test_pool_with_capacity(1);
        let (host_waiter, borrow_waiter) = contended_setup(&pool);

        // Discarding the session frees host capacity, so both the slot's
        // borrow waiters and the host queue get signalled.
        pool.core.remove_slot("mb-a");
        tokio::time::timeout(Duration::from_millis(50), borrow_waiter.notified())
            .await
            .expect("borrow waiter woken on slot removal");
        tokio::time::timeout(Duration::from_millis(50), host_waiter.notified())
            .await
            .expect("capacity waiter woken on slot removal");
    }

    #[test]
    fn test_waiters_order_by_priority_then_fifo() {
        let s = settings();
        let mut group = HostGroup::new(&s);
        let (low_key, _low) = group.park(Priority::Low, 1);
        let (_, high_late) = group.park(Priority::High, 3);
        let (_, high_early) = group.park(Priority::High, 2);
        let (_, _medium) = group.park(Priority::Medium, 4);

        let order: Vec<Arc<Notify>> = group.waiters.values().cloned().collect();
        assert_eq!(order.len(), 4);
        assert!(Arc::ptr_eq(&order[0], &high_early));
        assert!(Arc::ptr_eq(&order[1], &high_late));

        // The wake targets the earliest high-priority waiter; unparking
        // shrinks the queue without disturbing the order.
        group.unpark(&low_key);
        assert_eq!(group.waiters.len(), 3);
        assert!(Arc::ptr_eq(
            group.waiters.values().next().unwrap(),
            &high_early
        ));
    }

    fn discriminant_name(a: &Admission) -> &'static str {
        match a {
            Admission::Grant => "Grant",
            Admission::AtCapacity => "AtCapacity",
            Admission::RateLimited { .. } => "RateLimited",
        }
    }
}
