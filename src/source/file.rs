// ABOUTME: JSON row-dump source - reads rows exported from the clinic database
// ABOUTME: Accepts a bare array of objects or a document with an "appointments" array

use serde_json::Value;
use std::path::PathBuf;

use super::RecordSource;
use crate::error::{SyncError, SyncResult};
use crate::record::RawRow;
use crate::utils::{retry_with_backoff, RetryPolicy};

pub struct FileSource {
    path: PathBuf,
    retry: RetryPolicy,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn read(&self) -> SyncResult<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SyncError::SourceConnection(format!("failed to read {:?}: {}", self.path, e)))
    }
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parse a row dump into raw rows.
pub fn parse_rows(contents: &str) -> SyncResult<Vec<RawRow>> {
    let parsed: Value = serde_json::from_str(contents)
        .map_err(|e| SyncError::SourceQuery(format!("invalid JSON row dump: {}", e)))?;

    let items = match parsed {
        Value::Array(items) => items,
        Value::Object(mut doc) => match doc.remove("appointments") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(SyncError::SourceQuery(
                    "row dump object has no \"appointments\" array".to_string(),
                ))
            }
        },
        _ => {
            return Err(SyncError::SourceQuery(
                "row dump must be an array of objects".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| (k, scalar_to_string(v)))
                .collect()),
            _ => Err(SyncError::SourceQuery(format!(
                "row {} in dump is not an object",
                idx
            ))),
        })
        .collect()
}

impl RecordSource for FileSource {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn fetch(&self) -> SyncResult<Vec<RawRow>> {
        let contents = retry_with_backoff(|| self.read(), self.retry, "row dump read").await?;
        let rows = parse_rows(&contents)?;
        tracing::info!("Read {} rows from {:?}", rows.len(), self.path);
        Ok(rows)
    }
}
