//! Query surface over the `mailboxes` table.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::DbPool;
use crate::types::{IngestError, Mailbox};

fn mailbox_from_row(row: &Row<'_>) -> rusqlite::Result<Mailbox> {
    Ok(Mailbox {
        id: row.get("id")?,
        address: row.get("address")?,
        imap_host: row.get("imap_host")?,
        imap_port: row.get::<_, i64>("imap_port")? as u16,
        username: row.get("username")?,
        password: row.get("password")?,
        active: row.get::<_, i64>("active")? != 0,
        owner: row.get("owner")?,
        daily_limit: row.get::<_, i64>("daily_limit")? as u32,
        created_at: ms_to_utc(row.get("created_at")?),
        updated_at: ms_to_utc(row.get("updated_at")?),
    })
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub fn list_active(pool: &DbPool) -> Result<Vec<Mailbox>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, address, imap_host, imap_port, username, password,
                active, owner, daily_limit, created_at, updated_at
         FROM mailboxes WHERE active = 1 ORDER BY id",
    )?;
    let rows = stmt.query_map([], mailbox_from_row)?;
    let mut mailboxes = Vec::new();
    for row in rows {
        mailboxes.push(row?);
    }
    Ok(mailboxes)
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<Mailbox>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, address, imap_host, imap_port, username, password,
                active, owner, daily_limit, created_at, updated_at
         FROM mailboxes WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map([id], mailbox_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn upsert(pool: &DbPool, mailbox: &Mailbox) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO mailboxes
            (id, address, imap_host, imap_port, username, password,
             active, owner, daily_limit, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            address = excluded.address,
            imap_host = excluded.imap_host,
            imap_port = excluded.imap_port,
            username = excluded.username,
            password = excluded.password,
            active = excluded.active,
            owner = excluded.owner,
            daily_limit = excluded.daily_limit,
            updated_at = excluded.updated_at",
        rusqlite::params![
            mailbox.id,
            mailbox.address,
            mailbox.imap_host,
            mailbox.imap_port as i64,
            mailbox.username,
            mailbox.password,
            mailbox.active as i64,
            mailbox.owner,
            mailbox.daily_limit as i64,
            mailbox.created_at.timestamp_millis(),
            mailbox.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub fn set_active(pool: &DbPool, id: &str, active: bool) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE mailboxes SET active = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![id, active as i64, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::adapters::sqlite;

    pub fn sample_mailbox(id: &str) -> Mailbox {
        Mailbox {
            id: id.to_string(),
            address: format!("{}@example.com", id),
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            username: format!("{}@example.com", id),
            password: "hunter2".into(),
            active: true,
            owner: Some("ops".into()),
            daily_limit: 500,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn test_pool() -> DbPool {
        let file = tempfile::NamedTempFile::new().expect("temp db");
        let pool = sqlite::pool::create_pool(file.path()).expect("pool");
        // Keep the file alive for the life of the pool by leaking the handle;
        // the OS cleans the temp dir.
        std::mem::forget(file);
        let conn = pool.get().expect("conn");
        sqlite::schema::initialize_schema(&conn).expect("schema");
        pool
    }

    #[test]
    fn test_upsert_and_list_active() {
        let pool = test_pool();
        let mut mb = sample_mailbox("mb-1");
        upsert(&pool, &mb).unwrap();
        upsert(&pool, &sample_mailbox("mb-2")).unwrap();

        let active = list_active(&pool).unwrap();
        assert_eq!(active.len(), 2);

        mb.daily_limit = 2000;
        upsert(&pool, &mb).unwrap();
        let fetched = get(&pool, "mb-1").unwrap().unwrap();
        assert_eq!(fetched.daily_limit, 2000);

        set_active(&pool, "mb-1", false).unwrap();
        let active = list_active(&pool).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "mb-2");
    }
}
