//! Periodic change-log flush.

use super::ChangeLogBuffer;
use crate::shutdown::ShutdownSignal;
use crate::storage::PersistenceSink;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct FlushStats {
    pub cycles: AtomicU64,
    pub batches_written: AtomicU64,
    pub rows_written: AtomicU64,
    pub failures: AtomicU64,
    pub rows_requeued: AtomicU64,
    pub rows_dropped: AtomicU64,
}

impl FlushStats {
    pub fn summary(&self) -> String {
        format!(
            "cycles={} batches={} rows={} failures={} requeued={} dropped={}",
            self.cycles.load(Ordering::Relaxed),
            self.batches_written.load(Ordering::Relaxed),
            self.rows_written.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.rows_requeued.load(Ordering::Relaxed),
            self.rows_dropped.load(Ordering::Relaxed),
        )
    }
}

/// Moves the change log into the sink on a fixed interval.
pub struct FlushScheduler {
    buffer: Arc<ChangeLogBuffer>,
    sink: Arc<dyn PersistenceSink>,
    interval: Duration,
    requeue_on_failure: bool,
    stats: FlushStats,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<ChangeLogBuffer>,
        sink: Arc<dyn PersistenceSink>,
        interval: Duration,
        requeue_on_failure: bool,
    ) -> Self {
        Self {
            buffer,
            sink,
            interval,
            requeue_on_failure,
            stats: FlushStats::default(),
        }
    }

    pub fn buffer(&self) -> &Arc<ChangeLogBuffer> {
        &self.buffer
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Swap the buffer out and write it as one batch.
    ///
    /// An empty buffer performs no write. On failure the batch is put back
    /// at the head of the buffer, or dropped if re-queueing is off.
    pub async fn drain_and_flush(&self) -> Result<usize> {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let batch = self.buffer.drain();
        if batch.is_empty() {
            return Ok(0);
        }

        // Shared so the batch survives a writer that panics.
        let batch = Arc::new(batch);
        let sink = Arc::clone(&self.sink);
        let writing = Arc::clone(&batch);
        let result = match tokio::task::spawn_blocking(move || sink.append_changes(&writing)).await
        {
            Ok(result) => result,
            Err(e) => Err(anyhow!("flush writer task failed: {}", e)),
        };

        match result {
            Ok(rows) => {
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rows_written
                    .fetch_add(rows as u64, Ordering::Relaxed);
                debug!(rows, "change log flushed");
                Ok(rows)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let rows = batch.len();
                if self.requeue_on_failure {
                    let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
                    self.buffer.restore(batch);
                    self.stats
                        .rows_requeued
                        .fetch_add(rows as u64, Ordering::Relaxed);
                    warn!(rows, error = %e, "flush failed, batch re-queued");
                } else {
                    self.stats
                        .rows_dropped
                        .fetch_add(rows as u64, Ordering::Relaxed);
                    error!(rows, error = %e, "flush failed, batch dropped");
                }
                Err(e)
            }
        }
    }

    /// Flush immediately, then every interval, until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.drain_and_flush().await {
                debug!(error = %e, pending = self.buffer.len(), "flush cycle failed");
            }
        }

        info!(stats = %self.stats.summary(), "flush scheduler stopped");
    }
}
