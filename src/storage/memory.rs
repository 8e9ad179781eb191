//! In-process sink that keeps everything it is given.
//!
//! Used by tests and dry runs. Failures can be injected per call kind.

use super::PersistenceSink;
use crate::models::{BookChange, ChangeRecord, CheckpointMarker};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One checkpoint as the sink saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    pub marker: CheckpointMarker,
    pub row_count: usize,
}

#[derive(Default)]
pub struct MemorySink {
    changes: Mutex<Vec<ChangeRecord>>,
    change_batches: AtomicUsize,
    checkpoint_rows: Mutex<Vec<(CheckpointMarker, BookChange)>>,
    markers: Mutex<Vec<StoredCheckpoint>>,
    failing_change_writes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` change-batch writes fail.
    pub fn fail_next_change_writes(&self, n: usize) {
        self.failing_change_writes.store(n, Ordering::SeqCst);
    }

    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.changes.lock().clone()
    }

    /// Number of successful change-batch writes.
    pub fn change_batches(&self) -> usize {
        self.change_batches.load(Ordering::SeqCst)
    }

    pub fn checkpoint_rows(&self) -> Vec<(CheckpointMarker, BookChange)> {
        self.checkpoint_rows.lock().clone()
    }

    pub fn checkpoints(&self) -> Vec<StoredCheckpoint> {
        self.markers.lock().clone()
    }
}

impl PersistenceSink for MemorySink {
    fn append_changes(&self, batch: &[ChangeRecord]) -> Result<usize> {
        let failing = self
            .failing_change_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            bail!("injected change write failure");
        }

        self.changes.lock().extend_from_slice(batch);
        self.change_batches.fetch_add(1, Ordering::SeqCst);
        Ok(batch.len())
    }

    fn append_checkpoint_rows(
        &self,
        marker: &CheckpointMarker,
        rows: &[BookChange],
    ) -> Result<usize> {
        self.checkpoint_rows
            .lock()
            .extend(rows.iter().map(|row| (*marker, row.clone())));
        Ok(rows.len())
    }

    fn append_checkpoint_marker(&self, marker: &CheckpointMarker, row_count: usize) -> Result<()> {
        self.markers.lock().push(StoredCheckpoint {
            marker: *marker,
            row_count,
        });
        Ok(())
    }
}
