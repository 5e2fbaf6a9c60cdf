//! Status store adapter: per-mailbox connection lifecycle, counters, and
//! the poll watermark.
//!
//! Upserts for the same mailbox are serialized locally — one in-flight
//! upsert per mailbox id at a time. Counter bumps are single atomic
//! `UPDATE ... SET n = n + ?` statements and need no serialization.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use tokio::sync::Mutex;
use tracing::warn;

use super::DbPool;
use crate::types::{ConnState, IngestError, Mailbox, StatusRecord};

/// Monotonic counters on the status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Attempts,
    Successes,
    Failures,
    MessagesProcessed,
}

impl Counter {
    fn column(&self) -> &'static str {
        match self {
            Self::Attempts => "connection_attempts",
            Self::Successes => "successes",
            Self::Failures => "failures",
            Self::MessagesProcessed => "messages_processed",
        }
    }
}

pub struct StatusStore {
    pool: DbPool,
    upsert_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StatusStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            upsert_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, mailbox_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.upsert_locks.lock().await;
        locks
            .entry(mailbox_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotent upsert keyed by mailbox id. On a duplicate-key error the
    /// write is retried once as a plain update.
    pub async fn upsert(&self, record: &StatusRecord) -> Result<(), IngestError> {
        let lock = self.lock_for(&record.mailbox_id).await;
        let _guard = lock.lock().await;

        let conn = self.pool.get()?;
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM mailbox_status WHERE mailbox_id = ?1",
            [&record.mailbox_id],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?;

        if exists {
            update_record(&conn, record)?;
            return Ok(());
        }

        match insert_record(&conn, record) {
            Ok(()) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                warn!(
                    mailbox_id = %record.mailbox_id,
                    "status insert hit duplicate key, retrying as update"
                );
                update_record(&conn, record).map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure a default row exists for the mailbox.
    pub fn ensure_exists(&self, mailbox_id: &str) -> Result<(), IngestError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO mailbox_status (mailbox_id, state) VALUES (?1, 'disconnected')",
            [mailbox_id],
        )?;
        Ok(())
    }

    /// Record a state transition, stamping the timestamps that belong to it.
    pub fn set_state(
        &self,
        mailbox_id: &str,
        state: ConnState,
        error: Option<&str>,
    ) -> Result<(), IngestError> {
        self.ensure_exists(mailbox_id)?;
        let conn = self.pool.get()?;
        let now = Utc::now().timestamp_millis();
        match state {
            ConnState::Connected | ConnState::Idle => {
                conn.execute(
                    "UPDATE mailbox_status
                     SET state = ?2, last_connected_at = ?3, last_error = NULL
                     WHERE mailbox_id = ?1",
                    rusqlite::params![mailbox_id, state.as_str(), now],
                )?;
            }
            ConnState::Disconnected => {
                conn.execute(
                    "UPDATE mailbox_status SET state = ?2, last_disconnected_at = ?3
                     WHERE mailbox_id = ?1",
                    rusqlite::params![mailbox_id, state.as_str(), now],
                )?;
            }
            ConnState::Error => {
                conn.execute(
                    "UPDATE mailbox_status
                     SET state = ?2, last_error_at = ?3, last_error = ?4
                     WHERE mailbox_id = ?1",
                    rusqlite::params![mailbox_id, state.as_str(), now, error],
                )?;
            }
            ConnState::Connecting | ConnState::Reconnecting => {
                conn.execute(
                    "UPDATE mailbox_status SET state = ?2 WHERE mailbox_id = ?1",
                    rusqlite::params![mailbox_id, state.as_str()],
                )?;
            }
        }
        Ok(())
    }

    /// Atomic counter bump.
    pub fn increment(
        &self,
        mailbox_id: &str,
        counter: Counter,
        by: u64,
    ) -> Result<(), IngestError> {
        self.ensure_exists(mailbox_id)?;
        let conn = self.pool.get()?;
        let sql = format!(
            "UPDATE mailbox_status SET {col} = {col} + ?2 WHERE mailbox_id = ?1",
            col = counter.column()
        );
        conn.execute(&sql, rusqlite::params![mailbox_id, by as i64])?;
        Ok(())
    }

    pub fn set_next_reconnect(
        &self,
        mailbox_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        self.ensure_exists(mailbox_id)?;
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE mailbox_status SET next_reconnect_at = ?2 WHERE mailbox_id = ?1",
            rusqlite::params![mailbox_id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn set_active(&self, mailbox_id: &str, active: bool) -> Result<(), IngestError> {
        self.ensure_exists(mailbox_id)?;
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE mailbox_status SET active = ?2 WHERE mailbox_id = ?1",
            rusqlite::params![mailbox_id, active as i64],
        )?;
        Ok(())
    }

    pub fn get(&self, mailbox_id: &str) -> Result<Option<StatusRecord>, IngestError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT mailbox_id, state, last_connected_at, last_disconnected_at,
                    last_error_at, last_error, connection_attempts, successes,
                    failures, messages_processed, next_reconnect_at, active,
                    last_processed_seq, watermark_updated_at
             FROM mailbox_status WHERE mailbox_id = ?1",
        )?;
        let mut rows = stmt.query_map([mailbox_id], record_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// The watermark: largest sequence number fully submitted to the sink.
    pub fn watermark(&self, mailbox_id: &str) -> Result<Option<u32>, IngestError> {
        let conn = self.pool.get()?;
        let seq: Option<Option<i64>> = conn
            .query_row(
                "SELECT last_processed_seq FROM mailbox_status WHERE mailbox_id = ?1",
                [mailbox_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(seq.flatten().map(|s| s as u32))
    }

    pub fn set_watermark(&self, mailbox_id: &str, seq: u32) -> Result<(), IngestError> {
        self.ensure_exists(mailbox_id)?;
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE mailbox_status
             SET last_processed_seq = ?2, watermark_updated_at = ?3
             WHERE mailbox_id = ?1",
            rusqlite::params![mailbox_id, seq as i64, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Fleet-wide counter totals: (messages processed, failures).
    pub fn totals(&self) -> Result<(u64, u64), IngestError> {
        let conn = self.pool.get()?;
        let (processed, failed): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(messages_processed), 0), COALESCE(SUM(failures), 0)
             FROM mailbox_status",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((processed as u64, failed as u64))
    }

    /// Active mailboxes whose state calls for a reconnect.
    pub fn needing_reconnection(&self) -> Result<Vec<String>, IngestError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT mailbox_id FROM mailbox_status
             WHERE active = 1 AND state IN ('disconnected', 'error', 'reconnecting')
             ORDER BY mailbox_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Join query: active mailboxes with their current status, if any.
    pub fn active_with_status(
        &self,
    ) -> Result<Vec<(Mailbox, Option<StatusRecord>)>, IngestError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.address, m.imap_host, m.imap_port, m.username,
                    m.password, m.active, m.owner, m.daily_limit,
                    m.created_at, m.updated_at,
                    s.mailbox_id, s.state, s.last_connected_at,
                    s.last_disconnected_at, s.last_error_at, s.last_error,
                    s.connection_attempts, s.successes, s.failures,
                    s.messages_processed, s.next_reconnect_at, s.active,
                    s.last_processed_seq, s.watermark_updated_at
             FROM mailboxes m
             LEFT JOIN mailbox_status s ON s.mailbox_id = m.id
             WHERE m.active = 1
             ORDER BY m.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let mailbox = Mailbox {
                id: row.get(0)?,
                address: row.get(1)?,
                imap_host: row.get(2)?,
                imap_port: row.get::<_, i64>(3)? as u16,
                username: row.get(4)?,
                password: row.get(5)?,
                active: row.get::<_, i64>(6)? != 0,
                owner: row.get(7)?,
                daily_limit: row.get::<_, i64>(8)? as u32,
                created_at: ms_to_utc(row.get(9)?),
                updated_at: ms_to_utc(row.get(10)?),
            };
            let status = match row.get::<_, Option<String>>(11)? {
                Some(_) => Some(record_from_row_offset(row, 11)?),
                None => None,
            };
            Ok((mailbox, status))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn insert_record(conn: &Connection, r: &StatusRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO mailbox_status
            (mailbox_id, state, last_connected_at, last_disconnected_at,
             last_error_at, last_error, connection_attempts, successes,
             failures, messages_processed, next_reconnect_at, active,
             last_processed_seq, watermark_updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            r.mailbox_id,
            r.state.as_str(),
            r.last_connected_at.map(|t| t.timestamp_millis()),
            r.last_disconnected_at.map(|t| t.timestamp_millis()),
            r.last_error_at.map(|t| t.timestamp_millis()),
            r.last_error,
            r.connection_attempts as i64,
            r.successes as i64,
            r.failures as i64,
            r.messages_processed as i64,
            r.next_reconnect_at.map(|t| t.timestamp_millis()),
            r.active as i64,
            r.last_processed_seq.map(|s| s as i64),
            r.watermark_updated_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn update_record(conn: &Connection, r: &StatusRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE mailbox_status SET
            state = ?2, last_connected_at = ?3, last_disconnected_at = ?4,
            last_error_at = ?5, last_error = ?6, connection_attempts = ?7,
            successes = ?8, failures = ?9, messages_processed = ?10,
            next_reconnect_at = ?11, active = ?12,
            last_processed_seq = ?13, watermark_updated_at = ?14
         WHERE mailbox_id = ?1",
        rusqlite::params![
            r.mailbox_id,
            r.state.as_str(),
            r.last_connected_at.map(|t| t.timestamp_millis()),
            r.last_disconnected_at.map(|t| t.timestamp_millis()),
            r.last_error_at.map(|t| t.timestamp_millis()),
            r.last_error,
            r.connection_attempts as i64,
            r.successes as i64,
            r.failures as i64,
            r.messages_processed as i64,
            r.next_reconnect_at.map(|t| t.timestamp_millis()),
            r.active as i64,
            r.last_processed_seq.map(|s| s as i64),
            r.watermark_updated_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn opt_ms_to_utc(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StatusRecord> {
    record_from_row_offset(row, 0)
}

fn record_from_row_offset(row: &Row<'_>, base: usize) -> rusqlite::Result<StatusRecord> {
    let state: String = row.get(base + 1)?;
    Ok(StatusRecord {
        mailbox_id: row.get(base)?,
        state: ConnState::parse(&state).unwrap_or(ConnState::Disconnected),
        last_connected_at: opt_ms_to_utc(row.get(base + 2)?),
        last_disconnected_at: opt_ms_to_utc(row.get(base + 3)?),
        last_error_at: opt_ms_to_utc(row.get(base + 4)?),
        last_error: row.get(base + 5)?,
        connection_attempts: row.get::<_, i64>(base + 6)? as u64,
        successes: row.get::<_, i64>(base + 7)? as u64,
        failures: row.get::<_, i64>(base + 8)? as u64,
        messages_processed: row.get::<_, i64>(base + 9)? as u64,
        next_reconnect_at: opt_ms_to_utc(row.get(base + 10)?),
        active: row.get::<_, i64>(base + 11)? != 0,
        last_processed_seq: row.get::<_, Option<i64>>(base + 12)?.map(|s| s as u32),
        watermark_updated_at: opt_ms_to_utc(row.get(base + 13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::mailboxes::{self, tests::sample_mailbox, tests::test_pool};

    fn store_with_mailboxes(ids: &[&str]) -> StatusStore {
        let pool = test_pool();
        for id in ids {
            mailboxes::upsert(&pool, &sample_mailbox(id)).unwrap();
        }
        StatusStore::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_twice_lands_as_update() {
        let s = store_with_mailboxes(&["mb-1"]);
        let mut record = StatusRecord::new("mb-1");
        s.upsert(&record).await.unwrap();

        record.state = ConnState::Connected;
        record.successes = 3;
        s.upsert(&record).await.unwrap();

        let fetched = s.get("mb-1").unwrap().unwrap();
        assert_eq!(fetched.state, ConnState::Connected);
        assert_eq!(fetched.successes, 3);
    }

    #[test]
    fn test_increment_is_cumulative() {
        let s = store_with_mailboxes(&["mb-1"]);
        s.ensure_exists("mb-1").unwrap();
        s.increment("mb-1", Counter::Attempts, 1).unwrap();
        s.increment("mb-1", Counter::Attempts, 2).unwrap();
        s.increment("mb-1", Counter::MessagesProcessed, 10).unwrap();

        let r = s.get("mb-1").unwrap().unwrap();
        assert_eq!(r.connection_attempts, 3);
        assert_eq!(r.messages_processed, 10);
        assert_eq!(r.failures, 0);
    }

    #[test]
    fn test_state_transitions_stamp_timestamps() {
        let s = store_with_mailboxes(&["mb-1"]);
        s.set_state("mb-1", ConnState::Connected, None).unwrap();
        let r = s.get("mb-1").unwrap().unwrap();
        assert!(r.last_connected_at.is_some());
        assert!(r.last_error_at.is_none());

        s.set_state("mb-1", ConnState::Error, Some("LOGIN failed")).unwrap();
        let r = s.get("mb-1").unwrap().unwrap();
        assert_eq!(r.state, ConnState::Error);
        assert_eq!(r.last_error.as_deref(), Some("LOGIN failed"));
        assert!(r.last_error_at.is_some());
    }

    #[test]
    fn test_watermark_starts_absent() {
        let s = store_with_mailboxes(&["mb-1"]);
        assert_eq!(s.watermark("mb-1").unwrap(), None);
        s.set_watermark("mb-1", 120).unwrap();
        assert_eq!(s.watermark("mb-1").unwrap(), Some(120));
        s.set_watermark("mb-1", 250).unwrap();
        assert_eq!(s.watermark("mb-1").unwrap(), Some(250));
    }

    #[test]
    fn test_needing_reconnection_filters_by_state_and_active() {
        let s = store_with_mailboxes(&["mb-1", "mb-2", "mb-3", "mb-4", "mb-5"]);
        s.set_state("mb-1", ConnState::Error, Some("reset")).unwrap();
        s.set_state("mb-2", ConnState::Connected, None).unwrap();
        s.set_state("mb-3", ConnState::Disconnected, None).unwrap();
        s.set_state("mb-4", ConnState::Reconnecting, None).unwrap();
        s.set_state("mb-5", ConnState::Error, None).unwrap();
        s.set_active("mb-5", false).unwrap();

        let ids = s.needing_reconnection().unwrap();
        assert_eq!(ids, vec!["mb-1", "mb-3", "mb-4"]);
    }

    #[test]
    fn test_join_query_returns_status_when_present() {
        let pool = test_pool();
        let s = StatusStore::new(pool.clone());
        mailboxes::upsert(&pool, &sample_mailbox("mb-1")).unwrap();
        mailboxes::upsert(&pool, &sample_mailbox("mb-2")).unwrap();
        s.set_state("mb-1", ConnState::Idle, None).unwrap();

        let joined = s.active_with_status().unwrap();
        assert_eq!(joined.len(), 2);
        let (mb1, status1) = &joined[0];
        assert_eq!(mb1.id, "mb-1");
        assert_eq!(status1.as_ref().unwrap().state, ConnState::Idle);
        let (mb2, status2) = &joined[1];
        assert_eq!(mb2.id, "mb-2");
        assert!(status2.is_none());
    }
}
