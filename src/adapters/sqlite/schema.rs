use rusqlite::Connection;

use crate::types::IngestError;

pub fn initialize_schema(conn: &Connection) -> Result<(), IngestError> {
    conn.execute_batch(
        "
        -- Monitored accounts (the configuration/credential query surface)
        CREATE TABLE IF NOT EXISTS mailboxes (
            id              TEXT PRIMARY KEY,   -- UUID
            address         TEXT NOT NULL UNIQUE,
            imap_host       TEXT NOT NULL,
            imap_port       INTEGER NOT NULL DEFAULT 993,
            username        TEXT NOT NULL,
            password        TEXT NOT NULL,
            active          INTEGER NOT NULL DEFAULT 1,
            owner           TEXT,
            daily_limit     INTEGER NOT NULL DEFAULT 0,  -- priority hint only
            created_at      INTEGER NOT NULL,   -- unix epoch ms
            updated_at      INTEGER NOT NULL
        );

        -- Connection lifecycle + counters, one row per mailbox
        CREATE TABLE IF NOT EXISTS mailbox_status (
            mailbox_id          TEXT PRIMARY KEY REFERENCES mailboxes(id),
            state               TEXT NOT NULL DEFAULT 'disconnected',
            last_connected_at   INTEGER,            -- unix epoch ms
            last_disconnected_at INTEGER,
            last_error_at       INTEGER,
            last_error          TEXT,
            connection_attempts INTEGER NOT NULL DEFAULT 0,
            successes           INTEGER NOT NULL DEFAULT 0,
            failures            INTEGER NOT NULL DEFAULT 0,
            messages_processed  INTEGER NOT NULL DEFAULT 0,
            next_reconnect_at   INTEGER,
            active              INTEGER NOT NULL DEFAULT 1,

            -- Watermark: largest IMAP sequence fully submitted to the sink
            last_processed_seq  INTEGER,
            watermark_updated_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_mailboxes_active ON mailboxes(active);
        CREATE INDEX IF NOT EXISTS idx_status_state     ON mailbox_status(state, active);
        ",
    )?;

    Ok(())
}
