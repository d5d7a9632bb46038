// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SQLite persistence for the outbound queue.

use std::path::Path;

use rusqlite::{params, Connection};

use super::migration::{all_migrations, MigrationRunner};
use super::{MessagePriority, QueueError, QueueStatus, QueuedMessage};

const COLUMNS: &str = "seq, id, chat_id, recipient_id, payload, priority, status, enqueued_at,
     next_retry_at, attempts, expires_at, last_attempt_at, last_error, is_favorite";

/// Queue records on disk.
pub struct QueueStore {
    conn: Connection,
}

impl QueueStore {
    /// Opens or creates a queue database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        let store = QueueStore { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let store = QueueStore { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), QueueError> {
        MigrationRunner::run(&self.conn, &all_migrations())
    }

    pub fn schema_version(&self) -> Result<u32, QueueError> {
        MigrationRunner::current_version(&self.conn)
    }

    // === Writes ===

    /// Inserts a new record. Returns its enqueue sequence number.
    pub fn insert(&self, message: &QueuedMessage) -> Result<i64, QueueError> {
        self.conn.execute(
            "INSERT INTO outbound_queue
             (id, chat_id, recipient_id, payload, priority, status, enqueued_at,
              next_retry_at, attempts, expires_at, last_attempt_at, last_error, is_favorite)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                message.id,
                message.chat_id,
                message.recipient_id,
                message.payload,
                message.priority.as_i64(),
                message.status.as_str(),
                message.enqueued_at as i64,
                message.next_retry_at.map(|t| t as i64),
                message.attempts as i64,
                message.expires_at as i64,
                message.last_attempt_at.map(|t| t as i64),
                message.last_error,
                message.is_favorite,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claims a message for an attempt. Only one attempt can hold the claim:
    /// returns false unless the record was `pending` or `retrying`.
    pub fn mark_sending(&self, id: &str, now: u64) -> Result<bool, QueueError> {
        let rows = self.conn.execute(
            "UPDATE outbound_queue
             SET status = 'sending', attempts = attempts + 1, last_attempt_at = ?1,
                 next_retry_at = NULL
             WHERE id = ?2 AND status IN ('pending', 'retrying')",
            params![now as i64, id],
        )?;
        Ok(rows > 0)
    }

    /// Ends an attempt with a scheduled retry. Returns false unless the
    /// record was `sending`.
    pub fn mark_retrying(
        &self,
        id: &str,
        next_retry_at: u64,
        error: &str,
    ) -> Result<bool, QueueError> {
        let rows = self.conn.execute(
            "UPDATE outbound_queue SET status = 'retrying', next_retry_at = ?1, last_error = ?2
             WHERE id = ?3 AND status = 'sending'",
            params![next_retry_at as i64, error, id],
        )?;
        Ok(rows > 0)
    }

    /// Ends an attempt as final. Returns false unless the record was `sending`.
    pub fn mark_attempt_failed(&self, id: &str, error: &str) -> Result<bool, QueueError> {
        let rows = self.conn.execute(
            "UPDATE outbound_queue SET status = 'failed', next_retry_at = NULL, last_error = ?1
             WHERE id = ?2 AND status = 'sending'",
            params![error, id],
        )?;
        Ok(rows > 0)
    }

    /// Fails a record whatever its status.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<bool, QueueError> {
        let rows = self.conn.execute(
            "UPDATE outbound_queue SET status = 'failed', next_retry_at = NULL, last_error = ?1
             WHERE id = ?2",
            params![error, id],
        )?;
        Ok(rows > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool, QueueError> {
        let rows = self
            .conn
            .execute("DELETE FROM outbound_queue WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Deletes a record and runs `hand_off` inside the same transaction.
    ///
    /// If `hand_off` fails the delete is rolled back and the record stays.
    /// Returns the removed record, or None if it did not exist.
    pub fn remove_with<F>(&self, id: &str, hand_off: F) -> Result<Option<QueuedMessage>, QueueError>
    where
        F: FnOnce(&QueuedMessage) -> Result<(), QueueError>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let Some(message) = get_on(&tx, id)? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM outbound_queue WHERE id = ?1", params![id])?;
        hand_off(&message)?;
        tx.commit()?;
        Ok(Some(message))
    }

    /// Moves records stranded in `sending` (crash mid-attempt) to `retrying`,
    /// due immediately.
    pub fn recover_sending(&self) -> Result<usize, QueueError> {
        let rows = self.conn.execute(
            "UPDATE outbound_queue SET status = 'retrying', next_retry_at = NULL
             WHERE status = 'sending'",
            [],
        )?;
        Ok(rows)
    }

    // === Reads ===

    pub fn get(&self, id: &str) -> Result<Option<QueuedMessage>, QueueError> {
        get_on(&self.conn, id)
    }

    /// Every record in dispatch order.
    pub fn all(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        self.query(
            &format!(
                "SELECT {} FROM outbound_queue ORDER BY priority DESC, seq ASC",
                COLUMNS
            ),
            params![],
        )
    }

    pub fn by_status(&self, status: QueueStatus) -> Result<Vec<QueuedMessage>, QueueError> {
        self.query(
            &format!(
                "SELECT {} FROM outbound_queue WHERE status = ?1 ORDER BY priority DESC, seq ASC",
                COLUMNS
            ),
            params![status.as_str()],
        )
    }

    /// Unexpired records that may be attempted at `now`, in dispatch order.
    pub fn due(&self, now: u64) -> Result<Vec<QueuedMessage>, QueueError> {
        self.query(
            &format!(
                "SELECT {} FROM outbound_queue
                 WHERE expires_at > ?1
                   AND (status = 'pending'
                        OR (status = 'retrying' AND (next_retry_at IS NULL OR next_retry_at <= ?1)))
                 ORDER BY priority DESC, seq ASC",
                COLUMNS
            ),
            params![now as i64],
        )
    }

    /// Active records whose deadline has passed.
    pub fn expired(&self, now: u64) -> Result<Vec<QueuedMessage>, QueueError> {
        self.query(
            &format!(
                "SELECT {} FROM outbound_queue
                 WHERE expires_at <= ?1 AND status IN ('pending', 'sending', 'retrying')
                 ORDER BY seq ASC",
                COLUMNS
            ),
            params![now as i64],
        )
    }

    /// In-flight records whose attempt started at or before `cutoff`.
    pub fn sending_since(&self, cutoff: u64) -> Result<Vec<QueuedMessage>, QueueError> {
        self.query(
            &format!(
                "SELECT {} FROM outbound_queue
                 WHERE status = 'sending' AND last_attempt_at <= ?1
                 ORDER BY seq ASC",
                COLUMNS
            ),
            params![cutoff as i64],
        )
    }

    /// Records counting against a recipient's capacity.
    pub fn count_active_for(&self, recipient_id: &str) -> Result<usize, QueueError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbound_queue
             WHERE recipient_id = ?1 AND status IN ('pending', 'sending', 'retrying')",
            params![recipient_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_by_status(&self, status: QueueStatus) -> Result<usize, QueueError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbound_queue WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbound_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(QueueError::from)
    }
}

fn get_on(conn: &Connection, id: &str) -> Result<Option<QueuedMessage>, QueueError> {
    let result = conn.query_row(
        &format!("SELECT {} FROM outbound_queue WHERE id = ?1", COLUMNS),
        params![id],
        row_to_message,
    );

    match result {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(QueueError::Storage(e)),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let status: String = row.get(6)?;
    Ok(QueuedMessage {
        seq: row.get(0)?,
        id: row.get(1)?,
        chat_id: row.get(2)?,
        recipient_id: row.get(3)?,
        payload: row.get(4)?,
        priority: MessagePriority::from_i64(row.get(5)?),
        status: QueueStatus::parse(&status),
        enqueued_at: row.get::<_, i64>(7)? as u64,
        next_retry_at: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
        attempts: row.get::<_, i64>(9)? as u32,
        expires_at: row.get::<_, i64>(10)? as u64,
        last_attempt_at: row.get::<_, Option<i64>>(11)?.map(|t| t as u64),
        last_error: row.get(12)?,
        is_favorite: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str) -> QueuedMessage {
        QueuedMessage {
            seq: 0,
            id: id.to_string(),
            chat_id: "c".to_string(),
            recipient_id: "bob".to_string(),
            payload: b"hi".to_vec(),
            priority: MessagePriority::Normal,
            status: QueueStatus::Pending,
            enqueued_at: 0,
            next_retry_at: None,
            attempts: 0,
            expires_at: 10_000,
            last_attempt_at: None,
            last_error: None,
            is_favorite: false,
        }
    }

    #[test]
    fn test_attempt_outcomes_need_a_claim() {
        let store = QueueStore::in_memory().unwrap();
        store.insert(&queued("m1")).unwrap();

        assert!(!store.mark_retrying("m1", 500, "timeout").unwrap());
        assert!(!store.mark_attempt_failed("m1", "timeout").unwrap());
        assert_eq!(store.get("m1").unwrap().unwrap().status, QueueStatus::Pending);

        assert!(store.mark_sending("m1", 1).unwrap());
        assert!(store.mark_retrying("m1", 500, "timeout").unwrap());
        // Already resolved; a second outcome for the same attempt is refused.
        assert!(!store.mark_attempt_failed("m1", "late").unwrap());
        let record = store.get("m1").unwrap().unwrap();
        assert_eq!(record.status, QueueStatus::Retrying);
        assert_eq!(record.next_retry_at, Some(500));

        assert!(store.delete("m1").unwrap());
        assert!(!store.mark_retrying("m1", 900, "timeout").unwrap());
    }
}
