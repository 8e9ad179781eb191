//! In-memory change log awaiting persistence.
//!
//! Sequence ids are allocated under the same lock as the append, so ids are
//! gap-free and buffer order equals id order no matter how many producers
//! there are.

use crate::models::{BookChange, ChangeRecord};
use parking_lot::Mutex;

struct BufferInner {
    next_sequence: u64,
    pending: Vec<ChangeRecord>,
}

pub struct ChangeLogBuffer {
    inner: Mutex<BufferInner>,
}

impl ChangeLogBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                next_sequence: 1,
                pending: Vec::with_capacity(1024),
            }),
        }
    }

    /// Append a change, returning its sequence id.
    pub fn append(&self, change: BookChange) -> u64 {
        let mut inner = self.inner.lock();
        let sequence_id = inner.next_sequence;
        inner.next_sequence += 1;
        inner
            .pending
            .push(ChangeRecord::from_change(sequence_id, change));
        sequence_id
    }

    /// Append several changes as one contiguous id range.
    pub fn append_all(&self, changes: impl IntoIterator<Item = BookChange>) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for change in changes {
            let sequence_id = inner.next_sequence;
            inner.next_sequence += 1;
            inner
                .pending
                .push(ChangeRecord::from_change(sequence_id, change));
            count += 1;
        }
        count
    }

    /// Take everything pending, leaving the buffer empty.
    pub fn drain(&self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.inner.lock().pending)
    }

    /// Put a drained batch back in front of anything appended since.
    pub fn restore(&self, mut batch: Vec<ChangeRecord>) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        batch.append(&mut inner.pending);
        inner.pending = batch;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id the next append will receive.
    pub fn next_sequence_id(&self) -> u64 {
        self.inner.lock().next_sequence
    }
}

impl Default for ChangeLogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
