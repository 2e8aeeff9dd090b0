// ABOUTME: Reconciles a row-oriented remote sink against the current record set
// ABOUTME: Batched in-place updates, then single appends, then descending-order deletions

use std::collections::{HashMap, HashSet};

use crate::error::{SinkPhase, SyncError, SyncResult};
use crate::record::Record;
use crate::sink::layout::row_key;
use crate::sink::{RowSink, RowUpdate, SheetLayout};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Mapping from record id to its current 1-based row in the remote store.
///
/// Only valid until the next append or deletion against that store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteRowIndex {
    rows: HashMap<String, usize>,
    /// Rows holding a key that also appears further down
    duplicate_rows: Vec<usize>,
}

impl RemoteRowIndex {
    /// Index scanned rows. Row 1 is the header; rows with an empty key are skipped.
    pub fn build(rows: &[Vec<String>]) -> Self {
        let mut index = Self::default();
        for (offset, row) in rows.iter().enumerate().skip(1) {
            let row_number = offset + 1;
            let Some(key) = row_key(row) else {
                continue;
            };
            if let Some(previous) = index.rows.insert(key.to_string(), row_number) {
                tracing::warn!(
                    "Key {} appears in rows {} and {}; keeping row {}",
                    key,
                    previous,
                    row_number,
                    row_number
                );
                index.duplicate_rows.push(previous);
            }
        }
        index
    }

    pub fn row_of(&self, id: &str) -> Option<usize> {
        self.rows.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn duplicate_rows(&self) -> &[usize] {
        &self.duplicate_rows
    }

    /// Rows to delete so that only `keep` ids remain, highest row first.
    pub fn obsolete_rows(&self, keep: &HashSet<&str>) -> Vec<usize> {
        let mut rows: Vec<usize> = self
            .rows
            .iter()
            .filter(|(key, _)| !keep.contains(key.as_str()))
            .map(|(_, row)| *row)
            .chain(self.duplicate_rows.iter().copied())
            .collect();
        rows.sort_unstable_by(|a, b| b.cmp(a));
        rows.dedup();
        rows
    }
}

/// The phase at which a pass stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: SinkPhase,
    pub message: String,
}

/// Outcome of one reconciliation pass against one sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub sink: String,
    pub updated: usize,
    pub appended: usize,
    pub deleted: usize,
    /// Rows found obsolete after the appends
    pub obsolete: usize,
    /// Set when the pass stopped before completing every phase
    pub failure: Option<PhaseFailure>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Drives one reconciliation pass against a row sink.
pub struct Reconciler<'a, S: RowSink> {
    sink: &'a S,
    layout: &'a SheetLayout,
    retry: RetryPolicy,
}

impl<'a, S: RowSink> Reconciler<'a, S> {
    pub fn new(sink: &'a S, layout: &'a SheetLayout) -> Self {
        Self {
            sink,
            layout,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for the scans and the batched update.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn scan(&self) -> SyncResult<Vec<Vec<String>>> {
        retry_with_backoff(|| self.sink.read_all_rows(), self.retry, "Sheet scan").await
    }

    async fn write_batch(&self, updates: &[RowUpdate]) -> SyncResult<()> {
        retry_with_backoff(|| self.sink.batch_update(updates), self.retry, "Batched row update")
            .await
    }

    /// Make the remote rows match `records`.
    ///
    /// Returns `Err` when the sink cannot be scanned or the batched update
    /// fails; nothing is appended or deleted in that case. Append and delete
    /// failures stop their phase and are reported in
    /// [`ReconcileReport::failure`] with the counts completed so far.
    pub async fn reconcile(&self, records: &[Record]) -> SyncResult<ReconcileReport> {
        let mut report = ReconcileReport {
            sink: self.sink.describe(),
            ..Default::default()
        };

        self.sink.prepare().await?;

        let rows = self.scan().await?;
        let header_write = match rows.first() {
            Some(first) if first.iter().any(|cell| !cell.trim().is_empty()) => {
                if !self.layout.is_header(first) {
                    tracing::warn!(
                        "Row 1 of {} does not look like a header; it is left untouched",
                        report.sink
                    );
                }
                None
            }
            _ => {
                tracing::info!("Header row of {} is missing, writing it", report.sink);
                Some(RowUpdate {
                    row: 1,
                    values: self.layout.header(),
                })
            }
        };
        let index = RemoteRowIndex::build(&rows);
        tracing::info!(
            "Indexed {} existing rows in {}",
            index.len(),
            report.sink
        );

        let written_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut updates: Vec<RowUpdate> = header_write.into_iter().collect();
        let mut appends: Vec<Vec<String>> = Vec::new();
        let mut current_ids: HashSet<&str> = HashSet::new();

        for record in records {
            if !current_ids.insert(record.id()) {
                tracing::warn!("Record {} listed twice; writing it once", record.id());
                continue;
            }
            let values = self.layout.format_row(record, &written_at);
            match index.row_of(record.id()) {
                Some(row) => updates.push(RowUpdate { row, values }),
                None => appends.push(values),
            }
        }

        if !updates.is_empty() {
            self.write_batch(&updates).await?;
            report.updated = updates.iter().filter(|u| u.row > 1).count();
            tracing::info!("Updated {} rows in {}", report.updated, report.sink);
        }

        for values in &appends {
            if let Err(e) = self.sink.append_row(values).await {
                tracing::error!(
                    "Append failed after {} of {} rows in {}: {}",
                    report.appended,
                    appends.len(),
                    report.sink,
                    e
                );
                report.failure = Some(failure(SinkPhase::Append, e));
                return Ok(report);
            }
            report.appended += 1;
        }
        if report.appended > 0 {
            tracing::info!("Appended {} rows to {}", report.appended, report.sink);
        }

        let rows = match self.scan().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Re-scan of {} failed, skipping deletions: {}", report.sink, e);
                report.failure = Some(failure(SinkPhase::Scan, e));
                return Ok(report);
            }
        };
        let obsolete = RemoteRowIndex::build(&rows).obsolete_rows(&current_ids);
        report.obsolete = obsolete.len();

        for row in obsolete {
            if let Err(e) = self.sink.delete_row(row).await {
                tracing::error!(
                    "Deleting row {} of {} failed after {} deletions: {}",
                    row,
                    report.sink,
                    report.deleted,
                    e
                );
                report.failure = Some(failure(SinkPhase::Delete, e));
                return Ok(report);
            }
            report.deleted += 1;
        }
        if report.deleted > 0 {
            tracing::info!("Deleted {} obsolete rows from {}", report.deleted, report.sink);
        }

        Ok(report)
    }
}

fn failure(phase: SinkPhase, err: SyncError) -> PhaseFailure {
    PhaseFailure {
        phase,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(keys: &[&str]) -> Vec<Vec<String>> {
        keys.iter().map(|k| vec![k.to_string()]).collect()
    }

    #[test]
    fn test_index_skips_header_and_blank_keys() {
        let index = RemoteRowIndex::build(&rows(&["Registro", "10", "", "  ", " 12 "]));
        assert_eq!(index.len(), 2);
        assert_eq!(index.row_of("10"), Some(2));
        assert_eq!(index.row_of("12"), Some(5));
        assert_eq!(index.row_of("Registro"), None);
    }

    #[test]
    fn test_index_last_duplicate_wins() {
        let index = RemoteRowIndex::build(&rows(&["Registro", "7", "8", "7"]));
        assert_eq!(index.row_of("7"), Some(4));
        assert_eq!(index.duplicate_rows(), &[2]);
    }

    #[test]
    fn test_obsolete_rows_descending() {
        let index = RemoteRowIndex::build(&rows(&["Registro", "A", "B", "C", "D", "A"]));
        let keep: HashSet<&str> = ["A", "C"].into_iter().collect();
        assert_eq!(index.obsolete_rows(&keep), vec![5, 3, 2]);
    }

    #[test]
    fn test_blank_rows_never_obsolete() {
        let index = RemoteRowIndex::build(&rows(&["Registro", "", "X"]));
        let keep = HashSet::new();
        assert_eq!(index.obsolete_rows(&keep), vec![3]);
    }

    #[test]
    fn test_report_success() {
        let mut report = ReconcileReport::default();
        assert!(report.is_success());
        report.failure = Some(PhaseFailure {
            phase: SinkPhase::Delete,
            message: "boom".to_string(),
        });
        assert!(!report.is_success());
    }
}
