//! Periodic full-book checkpoints.
//!
//! Each cycle opens its own short-lived session, takes the snapshot that
//! follows the subscribe handshake, and writes its `initial` rows together
//! with the checkpoint marker. The change log is never touched.

use crate::error::FeedError;
use crate::feed::{FeedConnector, FeedSession, OpenOutcome, RetryPolicy};
use crate::models::{now_ms, CheckpointMarker};
use crate::normalize::{EventNormalizer, FeedUpdate, NormalizeMode};
use crate::shutdown::ShutdownSignal;
use crate::storage::PersistenceSink;
use anyhow::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of one checkpoint cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Written { timestamp_ms: i64, rows: usize },
    /// Snapshot held no rows; nothing written.
    Empty,
    /// Cycle given up; the next timer tick tries again.
    Abandoned(String),
    Cancelled,
}

#[derive(Debug, Default)]
pub struct CheckpointStats {
    pub cycles: AtomicU64,
    pub written: AtomicU64,
    pub rows_written: AtomicU64,
    pub empty: AtomicU64,
    pub abandoned: AtomicU64,
}

impl CheckpointStats {
    pub fn summary(&self) -> String {
        format!(
            "cycles={} written={} rows={} empty={} abandoned={}",
            self.cycles.load(Ordering::Relaxed),
            self.written.load(Ordering::Relaxed),
            self.rows_written.load(Ordering::Relaxed),
            self.empty.load(Ordering::Relaxed),
            self.abandoned.load(Ordering::Relaxed),
        )
    }
}

enum SnapshotError {
    Cancelled,
    Feed(FeedError),
    NotSnapshot,
}

pub struct CheckpointScheduler {
    connector: FeedConnector,
    sink: Arc<dyn PersistenceSink>,
    interval: Duration,
    max_attempts: u32,
    snapshot_timeout: Duration,
    stats: CheckpointStats,
}

impl CheckpointScheduler {
    pub fn new(
        connector: FeedConnector,
        sink: Arc<dyn PersistenceSink>,
        interval: Duration,
        max_attempts: u32,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            sink,
            interval,
            max_attempts: max_attempts.max(1),
            snapshot_timeout,
            stats: CheckpointStats::default(),
        }
    }

    pub fn stats(&self) -> &CheckpointStats {
        &self.stats
    }

    /// Run one checkpoint cycle.
    pub async fn capture_checkpoint(&self, shutdown: &mut ShutdownSignal) -> CheckpointOutcome {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let policy = RetryPolicy::Bounded {
            max_attempts: self.max_attempts,
        };
        let mut session = match self.connector.open(policy, shutdown).await {
            OpenOutcome::Opened(session) => session,
            OpenOutcome::Cancelled => return CheckpointOutcome::Cancelled,
            OpenOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                return self.abandon(format!(
                    "connect failed after {} attempts: {}",
                    attempts, last_error
                ));
            }
        };

        let snapshot = self.read_snapshot(session.as_mut(), shutdown).await;
        self.connector
            .close(session.as_mut(), "checkpoint captured")
            .await;

        let update = match snapshot {
            Ok(update) => update,
            Err(SnapshotError::Cancelled) => return CheckpointOutcome::Cancelled,
            Err(SnapshotError::Feed(e)) => return self.abandon(e.to_string()),
            Err(SnapshotError::NotSnapshot) => {
                return self.abandon("first update was not a snapshot".to_string())
            }
        };

        if update.changes.is_empty() {
            self.stats.empty.fetch_add(1, Ordering::Relaxed);
            warn!("checkpoint snapshot held no rows");
            return CheckpointOutcome::Empty;
        }

        let marker = CheckpointMarker {
            timestamp_ms: update.timestamp_ms,
        };
        let rows = update.changes;
        let sink = Arc::clone(&self.sink);

        // Rows and marker land together or not at all.
        let written =
            tokio::task::spawn_blocking(move || sink.append_checkpoint(&marker, &rows))
                .await
                .context("checkpoint writer task failed");

        match written {
            Ok(Ok(rows)) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rows_written
                    .fetch_add(rows as u64, Ordering::Relaxed);
                info!(timestamp_ms = marker.timestamp_ms, rows, "checkpoint written");
                CheckpointOutcome::Written {
                    timestamp_ms: marker.timestamp_ms,
                    rows,
                }
            }
            Ok(Err(e)) | Err(e) => self.abandon(format!("checkpoint write failed: {:#}", e)),
        }
    }

    async fn read_snapshot(
        &self,
        session: &mut dyn FeedSession,
        shutdown: &mut ShutdownSignal,
    ) -> Result<FeedUpdate, SnapshotError> {
        let normalizer = EventNormalizer::new(NormalizeMode::Checkpoint);
        let deadline = Instant::now() + self.snapshot_timeout;

        loop {
            let received = tokio::select! {
                _ = shutdown.wait() => return Err(SnapshotError::Cancelled),
                received = tokio::time::timeout_at(deadline, session.receive()) => received,
            };

            let raw = match received {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => return Err(SnapshotError::Feed(e)),
                Err(_) => {
                    return Err(SnapshotError::Feed(FeedError::Timeout {
                        what: "checkpoint snapshot",
                        timeout: self.snapshot_timeout,
                    }))
                }
            };

            // Heartbeats and acks may precede the snapshot.
            match normalizer.parse_update(&raw, now_ms()) {
                Some(update) if update.snapshot => {
                    debug!(rows = update.changes.len(), "checkpoint snapshot received");
                    return Ok(update);
                }
                Some(_) => return Err(SnapshotError::NotSnapshot),
                None => continue,
            }
        }
    }

    fn abandon(&self, reason: String) -> CheckpointOutcome {
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        warn!(reason = %reason, "checkpoint cycle abandoned");
        CheckpointOutcome::Abandoned(reason)
    }

    /// Capture immediately, then every interval, until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            if self.capture_checkpoint(&mut shutdown).await == CheckpointOutcome::Cancelled {
                break;
            }
        }

        info!(stats = %self.stats.summary(), "checkpoint scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedTransport;
    use crate::models::Reason;
    use crate::shutdown;
    use crate::storage::MemorySink;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Each open pops one script; `None` fails the open.
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Option<Vec<String>>>>,
        opens: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Option<Vec<&str>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|s| s.map(|msgs| msgs.into_iter().map(String::from).collect()))
                        .collect(),
                ),
                opens: AtomicU64::new(0),
            })
        }
    }

    struct ScriptedSession {
        messages: VecDeque<String>,
    }

    #[async_trait]
    impl FeedSession for ScriptedSession {
        async fn send_text(&mut self, _text: String) -> Result<(), FeedError> {
            Ok(())
        }

        async fn receive(&mut self) -> Result<String, FeedError> {
            match self.messages.pop_front() {
                Some(msg) => Ok(msg),
                // Silent feed.
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self, _reason: &str) {}
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn open(&self, endpoint: &str) -> Result<Box<dyn FeedSession>, FeedError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front().flatten();
            match script {
                Some(messages) => Ok(Box::new(ScriptedSession {
                    messages: messages.into(),
                })),
                None => Err(FeedError::Connect {
                    endpoint: endpoint.to_string(),
                    message: "refused".to_string(),
                }),
            }
        }
    }

    const SNAPSHOT: &str = r#"{"type":"update","socket_sequence":0,"events":[
        {"type":"change","side":"bid","price":"100","remaining":"1.5","reason":"initial"},
        {"type":"change","side":"ask","price":"101","remaining":"2","reason":"place"},
        {"type":"change","side":"ask","price":"102","remaining":"3","reason":"initial"}
    ]}"#;

    fn scheduler(transport: Arc<ScriptedTransport>, sink: Arc<MemorySink>) -> CheckpointScheduler {
        let connector = FeedConnector::new(
            transport,
            "wss://example.test/feed",
            None,
            Duration::from_millis(1_000),
        );
        CheckpointScheduler::new(
            connector,
            sink,
            Duration::from_secs(3_600),
            8,
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_writes_only_initial_rows_then_marker() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            r#"{"type":"heartbeat","socket_sequence":0}"#,
            SNAPSHOT,
        ])]);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = scheduler(transport, sink.clone());
        let (_tx, mut signal) = shutdown::channel();

        let (timestamp_ms, rows) = match checkpoints.capture_checkpoint(&mut signal).await {
            CheckpointOutcome::Written { timestamp_ms, rows } => (timestamp_ms, rows),
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(rows, 2);

        let stored = sink.checkpoint_rows();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|(_, row)| row.reason == Reason::Initial));
        assert!(stored.iter().all(|(m, _)| m.timestamp_ms == timestamp_ms));
        assert_eq!(sink.checkpoints().len(), 1);
        assert_eq!(sink.checkpoints()[0].row_count, 2);
        assert!(sink.changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_write_nothing() {
        let transport = ScriptedTransport::new(vec![None; 8]);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = scheduler(Arc::clone(&transport), sink.clone());
        let (_tx, mut signal) = shutdown::channel();

        let outcome = checkpoints.capture_checkpoint(&mut signal).await;
        assert!(matches!(outcome, CheckpointOutcome::Abandoned(_)));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 8);
        assert!(sink.checkpoints().is_empty());
        assert!(sink.checkpoint_rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_snapshot_times_out() {
        let transport = ScriptedTransport::new(vec![Some(vec![])]);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = scheduler(transport, sink.clone());
        let (_tx, mut signal) = shutdown::channel();

        let outcome = checkpoints.capture_checkpoint(&mut signal).await;
        assert!(matches!(outcome, CheckpointOutcome::Abandoned(ref r) if r.contains("timed out")));
        assert!(sink.checkpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_first_update_is_rejected() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            r#"{"type":"update","socket_sequence":4,"timestampms":10,"events":[]}"#,
        ])]);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = scheduler(transport, sink.clone());
        let (_tx, mut signal) = shutdown::channel();

        let outcome = checkpoints.capture_checkpoint(&mut signal).await;
        assert!(matches!(outcome, CheckpointOutcome::Abandoned(_)));
        assert!(sink.checkpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_snapshot_writes_nothing() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            r#"{"type":"update","socket_sequence":0,"events":[]}"#,
        ])]);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = scheduler(transport, sink.clone());
        let (_tx, mut signal) = shutdown::channel();

        assert_eq!(
            checkpoints.capture_checkpoint(&mut signal).await,
            CheckpointOutcome::Empty
        );
        assert!(sink.checkpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_wait() {
        let transport = ScriptedTransport::new(vec![None; 8]);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(scheduler(Arc::clone(&transport), sink));
        let (tx, signal) = shutdown::channel();

        let worker = {
            let checkpoints = Arc::clone(&checkpoints);
            tokio::spawn(async move { checkpoints.run(signal).await })
        };
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(transport.opens.load(Ordering::SeqCst) < 8);
        assert_eq!(checkpoints.stats().abandoned.load(Ordering::Relaxed), 0);
    }
}
