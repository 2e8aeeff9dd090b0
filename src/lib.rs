// ABOUTME: Library root for appointment-sync
// ABOUTME: Exports the sync modules and detects the source kind from its URL

pub mod backend;
pub mod config;
pub mod differ;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod reconciler;
pub mod record;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod utils;

use anyhow::{bail, Result};

/// Kind of source a configured URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    PostgreSQL,
    SQLite,
    /// A JSON row dump produced by an external exporter
    JsonFile,
}

/// Detect the source type from a connection string or path.
///
/// # Examples
///
/// ```
/// use appointment_sync::{detect_source_type, SourceType};
///
/// assert_eq!(
///     detect_source_type("postgresql://localhost/gesden").unwrap(),
///     SourceType::PostgreSQL
/// );
/// assert_eq!(detect_source_type("sqlite:clinic.db").unwrap(), SourceType::SQLite);
/// assert_eq!(detect_source_type("rows.json").unwrap(), SourceType::JsonFile);
/// ```
pub fn detect_source_type(url: &str) -> Result<SourceType> {
    let trimmed = url.trim();
    let lower = trimmed.to_lowercase();

    if lower.starts_with("postgresql://") || lower.starts_with("postgres://") {
        return Ok(SourceType::PostgreSQL);
    }
    if lower.starts_with("sqlite:")
        || lower.ends_with(".db")
        || lower.ends_with(".sqlite")
        || lower.ends_with(".sqlite3")
    {
        return Ok(SourceType::SQLite);
    }
    if lower.ends_with(".json") {
        return Ok(SourceType::JsonFile);
    }

    bail!(
        "Unsupported source {:?}. Expected a postgresql:// URL, a sqlite: path or *.db file, \
         or a *.json row dump",
        trimmed
    )
}
