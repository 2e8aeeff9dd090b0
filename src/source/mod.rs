// ABOUTME: Source collaborators that fetch raw appointment rows
// ABOUTME: Dispatches to PostgreSQL, SQLite or JSON row-dump sources by URL

pub mod file;
pub mod postgres;
pub mod sqlite;

use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::record::RawRow;
use crate::utils::RetryPolicy;
use crate::{detect_source_type, SourceType};

pub use file::FileSource;
pub use postgres::PostgresSource;
pub use sqlite::SqliteSource;

/// Something that can produce the current ordered set of raw rows.
///
/// Implementations retry connection establishment according to their retry
/// policy; query failures are never retried.
#[allow(async_fn_in_trait)]
pub trait RecordSource {
    /// Human-readable description for logs (no credentials).
    fn describe(&self) -> String;

    async fn fetch(&self) -> SyncResult<Vec<RawRow>>;
}

/// Source selected from configuration.
pub enum Source {
    Postgres(PostgresSource),
    Sqlite(SqliteSource),
    File(FileSource),
}

impl Source {
    /// Build the source described by the configuration.
    pub fn from_config(config: &SourceConfig, retry: RetryPolicy) -> SyncResult<Self> {
        let source_type = detect_source_type(&config.url)
            .map_err(|e| SyncError::Config(format!("{:#}", e)))?;
        let query_timeout = Duration::from_secs(config.query_timeout_secs);

        Ok(match source_type {
            SourceType::PostgreSQL => Source::Postgres(
                PostgresSource::new(&config.url, config.query.clone())
                    .with_timeouts(Duration::from_secs(config.connect_timeout_secs), query_timeout)
                    .with_retry(retry)
                    .accept_invalid_certs(config.accept_invalid_certs),
            ),
            SourceType::SQLite => Source::Sqlite(
                SqliteSource::new(sqlite::strip_scheme(&config.url), config.query.clone())
                    .with_retry(retry),
            ),
            SourceType::JsonFile => Source::File(FileSource::new(&config.url).with_retry(retry)),
        })
    }
}

impl RecordSource for Source {
    fn describe(&self) -> String {
        match self {
            Source::Postgres(s) => s.describe(),
            Source::Sqlite(s) => s.describe(),
            Source::File(s) => s.describe(),
        }
    }

    async fn fetch(&self) -> SyncResult<Vec<RawRow>> {
        match self {
            Source::Postgres(s) => s.fetch().await,
            Source::Sqlite(s) => s.fetch().await,
            Source::File(s) => s.fetch().await,
        }
    }
}
