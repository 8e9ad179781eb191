//! Durable storage for change and checkpoint records.
//!
//! The recorder only ever appends: a batch of change rows, a batch of
//! checkpoint rows, and a checkpoint marker. Each call is atomic on its own.

pub mod memory;
pub mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteSink;

use crate::models::{BookChange, ChangeRecord, CheckpointMarker};
use anyhow::Result;

/// Append-only persistence used by the flush and checkpoint workers.
///
/// Calls block; async callers run them on the blocking pool.
pub trait PersistenceSink: Send + Sync {
    /// Append one flushed batch of change records in order.
    fn append_changes(&self, batch: &[ChangeRecord]) -> Result<usize>;

    /// Append the rows of one checkpoint, tagged with its capture time.
    fn append_checkpoint_rows(&self, marker: &CheckpointMarker, rows: &[BookChange])
        -> Result<usize>;

    /// Record that a checkpoint with `row_count` rows is complete.
    fn append_checkpoint_marker(&self, marker: &CheckpointMarker, row_count: usize) -> Result<()>;

    /// Append a whole checkpoint: rows, then its marker.
    ///
    /// Durable stores override this so a failed marker leaves no rows behind.
    fn append_checkpoint(&self, marker: &CheckpointMarker, rows: &[BookChange]) -> Result<usize> {
        let stored = self.append_checkpoint_rows(marker, rows)?;
        self.append_checkpoint_marker(marker, stored)?;
        Ok(stored)
    }
}
