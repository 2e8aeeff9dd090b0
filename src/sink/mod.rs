// ABOUTME: Remote row-sink contract used by the reconciler
// ABOUTME: 1-based rows, row 1 reserved for the header and never targeted for data

pub mod layout;
pub mod memory;
pub mod sheets;

use crate::error::SyncResult;

pub use layout::SheetLayout;
pub use memory::MemorySink;
pub use sheets::{SheetsConfig, SheetsSink};

/// In-place replacement of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    /// 1-based row number
    pub row: usize,
    pub values: Vec<String>,
}

/// A tabular remote store addressed by 1-based row numbers.
///
/// Error phases: `read_all_rows` reports [`SinkPhase::Scan`](crate::error::SinkPhase),
/// `batch_update` reports `Update`, `append_row` reports `Append` and
/// `delete_row` reports `Delete`. Authentication failures are
/// [`SyncError::SinkAuth`](crate::error::SyncError).
#[allow(async_fn_in_trait)]
pub trait RowSink {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Make the sink ready for a pass (e.g. resolve or create the worksheet).
    async fn prepare(&self) -> SyncResult<()> {
        Ok(())
    }

    /// All rows, header included, in row order.
    async fn read_all_rows(&self) -> SyncResult<Vec<Vec<String>>>;

    /// Apply all updates in a single remote call.
    async fn batch_update(&self, updates: &[RowUpdate]) -> SyncResult<()>;

    /// Append one row after the last row.
    async fn append_row(&self, values: &[String]) -> SyncResult<()>;

    /// Delete one row; rows below it shift up by one.
    async fn delete_row(&self, row_number: usize) -> SyncResult<()>;
}
