// ABOUTME: In-memory row sink with the same row-shifting semantics as a spreadsheet
// ABOUTME: Records every call and can inject failures per phase for reconciliation tests

use std::sync::Mutex;

use super::{RowSink, RowUpdate};
use crate::error::{SinkPhase, SyncError, SyncResult};

/// One call made against a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    ReadAll,
    /// Row numbers updated in one batch
    BatchUpdate(Vec<usize>),
    /// First cell of the appended row
    Append(String),
    Delete(usize),
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    phase: SinkPhase,
    /// Number of successful calls of this phase before failing
    after: usize,
    /// How many calls to fail once triggered
    times: usize,
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<Vec<String>>,
    calls: Vec<SinkCall>,
    failures: Vec<Failure>,
    phase_calls: [usize; 4],
}

fn phase_slot(phase: SinkPhase) -> usize {
    match phase {
        SinkPhase::Scan => 0,
        SinkPhase::Update => 1,
        SinkPhase::Append => 2,
        SinkPhase::Delete => 3,
    }
}

impl State {
    /// Count a call of `phase` and decide whether it should fail.
    fn check(&mut self, phase: SinkPhase) -> SyncResult<()> {
        let slot = phase_slot(phase);
        let seen = self.phase_calls[slot];
        self.phase_calls[slot] += 1;
        let fails = self
            .failures
            .iter()
            .any(|f| f.phase == phase && seen >= f.after && seen < f.after + f.times);
        if fails {
            return Err(SyncError::sink_write(phase, "injected failure"));
        }
        Ok(())
    }
}

/// Sheet held in memory. Row 1 is the header.
#[derive(Debug, Default)]
pub struct MemorySink {
    name: String,
    state: Mutex<State>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Start with the given rows (header first).
    pub fn with_rows(name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        let sink = Self::new(name);
        sink.lock().rows = rows;
        sink
    }

    /// Fail `times` calls of `phase` after `after` successful ones.
    pub fn fail_on(&self, phase: SinkPhase, after: usize, times: usize) {
        self.lock().failures.push(Failure {
            phase,
            after,
            times,
        });
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.lock().rows.clone()
    }

    /// First-column values of all data rows (header skipped).
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .rows
            .iter()
            .skip(1)
            .map(|row| row.first().cloned().unwrap_or_default())
            .collect()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-call
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RowSink for MemorySink {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn read_all_rows(&self) -> SyncResult<Vec<Vec<String>>> {
        let mut state = self.lock();
        state.check(SinkPhase::Scan)?;
        state.calls.push(SinkCall::ReadAll);
        Ok(state.rows.clone())
    }

    async fn batch_update(&self, updates: &[RowUpdate]) -> SyncResult<()> {
        let mut state = self.lock();
        state.check(SinkPhase::Update)?;
        for update in updates {
            if update.row == 0 {
                return Err(SyncError::sink_write(SinkPhase::Update, "row numbers are 1-based"));
            }
        }
        for update in updates {
            while state.rows.len() < update.row {
                state.rows.push(Vec::new());
            }
            state.rows[update.row - 1] = update.values.clone();
        }
        state
            .calls
            .push(SinkCall::BatchUpdate(updates.iter().map(|u| u.row).collect()));
        Ok(())
    }

    async fn append_row(&self, values: &[String]) -> SyncResult<()> {
        let mut state = self.lock();
        state.check(SinkPhase::Append)?;
        state.rows.push(values.to_vec());
        state
            .calls
            .push(SinkCall::Append(values.first().cloned().unwrap_or_default()));
        Ok(())
    }

    async fn delete_row(&self, row_number: usize) -> SyncResult<()> {
        let mut state = self.lock();
        state.check(SinkPhase::Delete)?;
        if row_number < 2 || row_number > state.rows.len() {
            return Err(SyncError::sink_write(
                SinkPhase::Delete,
                format!("row {} out of range", row_number),
            ));
        }
        state.rows.remove(row_number - 1);
        state.calls.push(SinkCall::Delete(row_number));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str) -> Vec<String> {
        vec![key.to_string()]
    }

    #[tokio::test]
    async fn test_delete_shifts_rows() {
        let sink = MemorySink::with_rows("t", vec![row("Registro"), row("A"), row("B"), row("C")]);
        sink.delete_row(3).await.unwrap();
        assert_eq!(sink.keys(), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_header_row_is_protected() {
        let sink = MemorySink::with_rows("t", vec![row("Registro"), row("A")]);
        assert!(sink.delete_row(1).await.is_err());
        assert!(sink.delete_row(5).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_update_extends_rows() {
        let sink = MemorySink::new("t");
        sink.batch_update(&[RowUpdate {
            row: 1,
            values: row("Registro"),
        }])
        .await
        .unwrap();
        assert_eq!(sink.rows(), vec![row("Registro")]);
    }

    #[tokio::test]
    async fn test_injected_failure_window() {
        let sink = MemorySink::with_rows("t", vec![row("Registro")]);
        sink.fail_on(SinkPhase::Append, 1, 1);
        assert!(sink.append_row(&row("A")).await.is_ok());
        assert!(sink.append_row(&row("B")).await.is_err());
        assert!(sink.append_row(&row("C")).await.is_ok());
        assert_eq!(sink.keys(), vec!["A", "C"]);
    }
}
