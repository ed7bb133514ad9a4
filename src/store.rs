//! Durable traffic archive
//!
//! SQLite-backed store of captured exchanges with secondary indexes and a
//! conjunctive filter query, plus a small settings table. WAL journaling
//! keeps returned writes crash-consistent.

use crate::schema::{Exchange, ExchangeFilter, Headers, OpenRequest, ResponseRecord};
use parking_lot::Mutex;
use rusqlite::types::ToSqlOutput;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const EXCHANGE_COLUMNS: &str = "id, timestamp_ms, method, url, host, path, status, \
     request_headers, request_body, response_headers, response_body, \
     content_type, duration_ms, size_bytes";

pub struct TrafficStore {
    conn: Mutex<Connection>,
}

impl TrafficStore {
    /// Open (or create) the archive at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory archive, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> StoreResult<Self> {
        // Returns the resulting mode as a row, so query it rather than execute
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms INTEGER NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                request_headers TEXT NOT NULL,
                request_body BLOB,
                response_headers TEXT NOT NULL DEFAULT '{}',
                response_body BLOB,
                content_type TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_exchanges_timestamp
                ON exchanges(timestamp_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_exchanges_host ON exchanges(host);
            CREATE INDEX IF NOT EXISTS idx_exchanges_method ON exchanges(method);
            CREATE INDEX IF NOT EXISTS idx_exchanges_status ON exchanges(status);
            CREATE INDEX IF NOT EXISTS idx_exchanges_content_type
                ON exchanges(content_type);
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert the request half of an exchange. Returns the assigned id;
    /// AUTOINCREMENT keeps ids strictly increasing across deletes.
    pub fn insert_open(&self, open: &OpenRequest) -> StoreResult<i64> {
        let headers = serde_json::to_string(&open.request_headers)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO exchanges
                (timestamp_ms, method, url, host, path, status,
                 request_headers, request_body)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                open.timestamp_ms,
                open.method,
                open.url,
                open.host,
                open.path,
                headers,
                open.request_body,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the response half. Idempotent: a second call for the same id
    /// is a no-op and returns `false`.
    pub fn complete(&self, id: i64, record: &ResponseRecord) -> StoreResult<bool> {
        let headers = serde_json::to_string(&record.response_headers)?;
        let size = record
            .response_body
            .as_ref()
            .map(|b| b.len() as i64)
            .unwrap_or(0);
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE exchanges
             SET status = ?2, response_headers = ?3, response_body = ?4,
                 content_type = ?5, duration_ms = ?6, size_bytes = ?7,
                 completed = 1
             WHERE id = ?1 AND completed = 0",
            params![
                id,
                record.status,
                headers,
                record.response_body,
                record.content_type,
                record.duration_ms,
                size,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_by_id(&self, id: i64) -> StoreResult<Option<Exchange>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE id = ?1");
        let exchange = conn
            .query_row(&sql, params![id], row_to_exchange)
            .optional()?;
        Ok(exchange)
    }

    /// All predicates conjunctive; results ordered newest first.
    pub fn query(&self, filter: &ExchangeFilter) -> StoreResult<Vec<Exchange>> {
        let (where_sql, mut values) = filter_clauses(filter);
        let mut sql = format!(
            "SELECT {EXCHANGE_COLUMNS} FROM exchanges{where_sql} \
             ORDER BY timestamp_ms DESC, id DESC"
        );
        if filter.limit.is_some() || filter.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(SqlParam::Int(
                filter.limit.map(i64::from).unwrap_or(-1),
            ));
            values.push(SqlParam::Int(filter.offset.map(i64::from).unwrap_or(0)));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_exchange)?;

        let mut exchanges = Vec::new();
        for row in rows {
            exchanges.push(row?);
        }
        Ok(exchanges)
    }

    /// Number of rows matching the filter, ignoring limit/offset.
    pub fn count(&self, filter: &ExchangeFilter) -> StoreResult<i64> {
        let (where_sql, values) = filter_clauses(filter);
        let sql = format!("SELECT COUNT(*) FROM exchanges{where_sql}");
        let conn = self.conn.lock();
        let count =
            conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count)
    }

    pub fn distinct_hosts(&self) -> StoreResult<Vec<String>> {
        self.distinct("host")
    }

    pub fn distinct_methods(&self) -> StoreResult<Vec<String>> {
        self.distinct("method")
    }

    pub fn distinct_content_types(&self) -> StoreResult<Vec<String>> {
        self.distinct("content_type")
    }

    fn distinct(&self, column: &str) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {column} FROM exchanges \
             WHERE {column} IS NOT NULL ORDER BY {column} ASC"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    pub fn delete(&self, id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM exchanges WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Remove every exchange and reclaim the space.
    pub fn clear_all(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM exchanges", [])?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Delete exchanges that started more than `age_ms` ago. Returns how
    /// many rows were removed.
    pub fn sweep_older_than(&self, age_ms: i64) -> StoreResult<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - age_ms;
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM exchanges WHERE timestamp_ms < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!("Retention sweep removed {} exchanges", removed);
        }
        Ok(removed)
    }

    pub fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

enum SqlParam {
    Text(String),
    Int(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Int(i) => i.to_sql(),
        }
    }
}

fn filter_clauses(filter: &ExchangeFilter) -> (String, Vec<SqlParam>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlParam> = Vec::new();

    if let Some(text) = filter.text.as_ref().filter(|t| !t.is_empty()) {
        let needle = text.to_lowercase();
        clauses.push(
            "(instr(lower(url), ?) > 0 OR instr(lower(host), ?) > 0 \
             OR instr(lower(path), ?) > 0)"
                .to_string(),
        );
        values.push(SqlParam::Text(needle.clone()));
        values.push(SqlParam::Text(needle.clone()));
        values.push(SqlParam::Text(needle));
    }

    if !filter.methods.is_empty() {
        let marks = vec!["?"; filter.methods.len()].join(", ");
        clauses.push(format!("upper(method) IN ({marks})"));
        for method in &filter.methods {
            values.push(SqlParam::Text(method.to_uppercase()));
        }
    }

    if !filter.status_buckets.is_empty() {
        let ranges = vec!["status BETWEEN ? AND ?"; filter.status_buckets.len()];
        clauses.push(format!("({})", ranges.join(" OR ")));
        for bucket in &filter.status_buckets {
            let (lo, hi) = bucket.range();
            values.push(SqlParam::Int(i64::from(lo)));
            values.push(SqlParam::Int(i64::from(hi)));
        }
    }

    if !filter.hosts.is_empty() {
        let marks = vec!["?"; filter.hosts.len()].join(", ");
        clauses.push(format!("host IN ({marks})"));
        for host in &filter.hosts {
            values.push(SqlParam::Text(host.clone()));
        }
    }

    if !filter.content_types.is_empty() {
        let likes = vec![
            "instr(lower(ifnull(content_type, '')), ?) > 0";
            filter.content_types.len()
        ];
        clauses.push(format!("({})", likes.join(" OR ")));
        for content_type in &filter.content_types {
            values.push(SqlParam::Text(content_type.to_lowercase()));
        }
    }

    if let Some(since) = filter.since_ms {
        clauses.push("timestamp_ms >= ?".to_string());
        values.push(SqlParam::Int(since));
    }
    if let Some(until) = filter.until_ms {
        clauses.push("timestamp_ms <= ?".to_string());
        values.push(SqlParam::Int(until));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_sql, values)
}

fn row_to_exchange(row: &rusqlite::Row<'_>) -> rusqlite::Result<Exchange> {
    let request_headers: String = row.get(7)?;
    let response_headers: String = row.get(9)?;
    Ok(Exchange {
        id: row.get(0)?,
        timestamp_ms: row.get(1)?,
        method: row.get(2)?,
        url: row.get(3)?,
        host: row.get(4)?,
        path: row.get(5)?,
        status: row.get::<_, i64>(6)? as u16,
        request_headers: parse_headers(7, &request_headers)?,
        request_body: row.get(8)?,
        response_headers: parse_headers(9, &response_headers)?,
        response_body: row.get(10)?,
        content_type: row.get(11)?,
        duration_ms: row.get(12)?,
        size_bytes: row.get(13)?,
    })
}

fn parse_headers(column: usize, json: &str) -> rusqlite::Result<Headers> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}
