//! SQLite-backed durable queue.
//!
//! Producers insert rows into `http_request_queue`; the worker owns
//! `http_response`. Queue headers are stored as a JSON object of name to
//! value, response headers likewise (arrival order and duplicates kept).
//! Timestamps are unix milliseconds.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use netq_core::{Queue, QueueError, ResponseHeaders, ResponseRecord, WorkItem};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS http_request_queue (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    method  TEXT NOT NULL DEFAULT 'GET',
    url     TEXT NOT NULL,
    headers TEXT NOT NULL DEFAULT '{}',
    body    TEXT,
    created INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS http_request_queue_created ON http_request_queue (created);

CREATE TABLE IF NOT EXISTS http_response (
    id           INTEGER PRIMARY KEY,
    status_code  INTEGER,
    content_type TEXT,
    headers      TEXT,
    content      TEXT,
    timed_out    INTEGER NOT NULL DEFAULT 0,
    error_msg    TEXT,
    created      INTEGER NOT NULL
);
";

pub struct SqliteQueue {
    conn: Connection,
}

impl SqliteQueue {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(QueueError::backend)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(QueueError::backend)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory().map_err(QueueError::backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.execute_batch(SCHEMA).map_err(QueueError::backend)?;
        Ok(Self { conn })
    }

    /// Queue a request and return its id.
    pub fn enqueue(
        &self,
        method: &str,
        url: &str,
        headers: &[&str],
        body: Option<&str>,
    ) -> Result<i64, QueueError> {
        self.enqueue_aged(method, url, headers, body, Duration::ZERO)
    }

    /// Queue a request that was created `age` ago.
    pub fn enqueue_aged(
        &self,
        method: &str,
        url: &str,
        headers: &[&str],
        body: Option<&str>,
        age: Duration,
    ) -> Result<i64, QueueError> {
        let pairs: ResponseHeaders = headers
            .iter()
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();
        let created = now_millis().saturating_sub(age.as_millis().min(i64::MAX as u128) as i64);
        self.conn
            .execute(
                "INSERT INTO http_request_queue (method, url, headers, body, created)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![method, url, pairs.to_json(), body, created],
            )
            .map_err(QueueError::backend)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Response record for `id`, placeholder included.
    pub fn response(&self, id: i64) -> Result<Option<ResponseRecord>, QueueError> {
        let row = self
            .conn
            .query_row(
                "SELECT status_code, content_type, headers, content, timed_out, error_msg
                 FROM http_response WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, Option<u16>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(QueueError::backend)?;

        let Some((status_code, content_type, headers, content, timed_out, error_msg)) = row else {
            return Ok(None);
        };
        let headers = headers
            .map(|text| serde_json::from_str::<ResponseHeaders>(&text))
            .transpose()
            .map_err(QueueError::backend)?;
        Ok(Some(ResponseRecord {
            status_code,
            content,
            headers,
            content_type,
            timed_out,
            error_msg,
        }))
    }
}

impl Queue for SqliteQueue {
    fn is_ready(&mut self) -> Result<bool, QueueError> {
        let tables: i64 = self
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('http_request_queue', 'http_response')",
                [],
                |row| row.get(0),
            )
            .map_err(QueueError::backend)?;
        Ok(tables == 2)
    }

    fn purge(&mut self, ttl: Duration) -> Result<u64, QueueError> {
        let cutoff = now_millis().saturating_sub(ttl.as_millis().min(i64::MAX as u128) as i64);
        let deleted = self
            .conn
            .execute(
                "DELETE FROM http_request_queue WHERE created < ?1",
                [cutoff],
            )
            .map_err(QueueError::backend)?;
        Ok(deleted as u64)
    }

    fn fetch_pending(&mut self) -> Result<Vec<WorkItem>, QueueError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT q.id, q.method, q.url, q.headers, q.body
                 FROM http_request_queue q
                 LEFT JOIN http_response r ON r.id = q.id
                 WHERE r.id IS NULL
                 ORDER BY q.id",
            )
            .map_err(QueueError::backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(QueueError::backend)?;

        let mut items = Vec::new();
        for row in rows {
            let (id, method, url, headers, body) = row.map_err(QueueError::backend)?;
            let pairs: ResponseHeaders =
                serde_json::from_str(&headers).map_err(QueueError::backend)?;
            items.push(WorkItem {
                id,
                method,
                url,
                headers: pairs.iter().map(|(k, v)| format!("{k}: {v}")).collect(),
                body,
            });
        }
        Ok(items)
    }

    fn insert_placeholder(&mut self, id: i64) -> Result<(), QueueError> {
        match self.conn.execute(
            "INSERT INTO http_response (id, created) VALUES (?1, ?2)",
            params![id, now_millis()],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(QueueError::DuplicatePlaceholder(id))
            }
            Err(err) => Err(QueueError::backend(err)),
        }
    }

    fn update_response(&mut self, id: i64, record: &ResponseRecord) -> Result<(), QueueError> {
        let updated = self
            .conn
            .execute(
                "UPDATE http_response
                 SET status_code = ?2, content_type = ?3, headers = ?4, content = ?5,
                     timed_out = ?6, error_msg = ?7
                 WHERE id = ?1",
                params![
                    id,
                    record.status_code,
                    record.content_type,
                    record.headers.as_ref().map(ResponseHeaders::to_json),
                    record.content,
                    record.timed_out,
                    record.error_msg,
                ],
            )
            .map_err(QueueError::backend)?;
        if updated == 0 {
            return Err(QueueError::MissingPlaceholder(id));
        }
        Ok(())
    }

    fn abandon_in_flight(&mut self, error_msg: &str) -> Result<u64, QueueError> {
        let closed = self
            .conn
            .execute(
                "UPDATE http_response SET error_msg = ?1
                 WHERE status_code IS NULL AND error_msg IS NULL",
                [error_msg],
            )
            .map_err(QueueError::backend)?;
        Ok(closed as u64)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
