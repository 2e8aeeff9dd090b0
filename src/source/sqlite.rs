// ABOUTME: SQLite source - runs the configured appointment query against a database file
// ABOUTME: Stringifies every column value so rows can be turned into records

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;

use super::RecordSource;
use crate::error::{SyncError, SyncResult};
use crate::record::RawRow;
use crate::utils::{retry_with_backoff, RetryPolicy};

pub struct SqliteSource {
    path: PathBuf,
    query: String,
    retry: RetryPolicy,
}

/// Strip an optional `sqlite:` / `sqlite://` prefix from a source URL.
pub fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

impl SqliteSource {
    pub fn new(path: impl Into<PathBuf>, query: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: query.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Open the database read-only. Missing or locked files are connection errors.
    fn open(&self) -> SyncResult<Connection> {
        if !self.path.exists() {
            return Err(SyncError::SourceConnection(format!(
                "SQLite database {:?} does not exist",
                self.path
            )));
        }
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SyncError::SourceConnection(format!("failed to open {:?}: {}", self.path, e)))
    }

    fn run_query(&self, conn: &Connection) -> SyncResult<Vec<RawRow>> {
        let mut stmt = conn
            .prepare(&self.query)
            .map_err(|e| SyncError::SourceQuery(format!("failed to prepare query: {}", e)))?;

        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let rows = stmt
            .query_map([], |row| {
                let mut row_map = RawRow::new();
                for (idx, col_name) in column_names.iter().enumerate() {
                    let value: Value = row.get(idx)?;
                    row_map.insert(col_name.clone(), value_to_string(value));
                }
                Ok(row_map)
            })
            .map_err(|e| SyncError::SourceQuery(format!("failed to execute query: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::SourceQuery(format!("failed to read rows: {}", e)))?;

        Ok(rows)
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s,
        Value::Blob(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

impl RecordSource for SqliteSource {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    async fn fetch(&self) -> SyncResult<Vec<RawRow>> {
        tracing::info!("Connecting to SQLite database {:?}", self.path);
        let conn = retry_with_backoff(|| async { self.open() }, self.retry, "SQLite open").await?;

        let start = std::time::Instant::now();
        let rows = self.run_query(&conn)?;
        tracing::info!(
            "Query executed in {:.2}s, {} rows",
            start.elapsed().as_secs_f64(),
            rows.len()
        );
        Ok(rows)
    }
}
