//! Service wiring.
//!
//! [`MonitorService`] owns the configuration, change log, sink and
//! transports, and starts the three workers under one
//! [`ShutdownCoordinator`].

use crate::config::MonitorConfig;
use crate::feed::{FeedConnector, FeedReader, FeedTransport};
use crate::recorder::{ChangeLogBuffer, CheckpointScheduler, FlushScheduler};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::PersistenceSink;
use std::sync::Arc;
use tracing::info;

/// Handles to the running workers.
pub struct RunningMonitor {
    pub coordinator: Arc<ShutdownCoordinator>,
    pub reader: Arc<FeedReader>,
    pub flush: Arc<FlushScheduler>,
    pub checkpoints: Arc<CheckpointScheduler>,
}

pub struct MonitorService {
    config: MonitorConfig,
    buffer: Arc<ChangeLogBuffer>,
    sink: Arc<dyn PersistenceSink>,
    transport: Arc<dyn FeedTransport>,
    checkpoint_transport: Arc<dyn FeedTransport>,
}

impl MonitorService {
    pub fn new(
        config: MonitorConfig,
        sink: Arc<dyn PersistenceSink>,
        transport: Arc<dyn FeedTransport>,
    ) -> Self {
        Self {
            config,
            buffer: Arc::new(ChangeLogBuffer::new()),
            sink,
            checkpoint_transport: Arc::clone(&transport),
            transport,
        }
    }

    /// Use a separate transport for checkpoint sessions.
    pub fn with_checkpoint_transport(mut self, transport: Arc<dyn FeedTransport>) -> Self {
        self.checkpoint_transport = transport;
        self
    }

    fn connector(&self, transport: &Arc<dyn FeedTransport>) -> FeedConnector {
        FeedConnector::new(
            Arc::clone(transport),
            self.config.feed_endpoint(),
            self.config.subscribe_message(),
            self.config.connect_retry_interval(),
        )
    }

    /// Spawn the feed reader, flush and checkpoint workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> RunningMonitor {
        let coordinator = Arc::new(ShutdownCoordinator::new());

        let reader = Arc::new(FeedReader::new(
            self.connector(&self.transport),
            Arc::clone(&self.buffer),
        ));
        let flush = Arc::new(FlushScheduler::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.sink),
            self.config.flush_interval(),
            self.config.recorder.requeue_failed_flush,
        ));
        let checkpoints = Arc::new(CheckpointScheduler::new(
            self.connector(&self.checkpoint_transport),
            Arc::clone(&self.sink),
            self.config.checkpoint_interval(),
            self.config.feed.checkpoint_max_attempts,
            self.config.snapshot_timeout(),
        ));

        {
            let reader = Arc::clone(&reader);
            let signal = coordinator.signal();
            coordinator.register("feed_reader", tokio::spawn(async move { reader.run(signal).await }));
        }
        {
            let flush = Arc::clone(&flush);
            let signal = coordinator.signal();
            coordinator.register("flush", tokio::spawn(async move { flush.run(signal).await }));
        }
        {
            let checkpoints = Arc::clone(&checkpoints);
            let signal = coordinator.signal();
            coordinator.register(
                "checkpoint",
                tokio::spawn(async move { checkpoints.run(signal).await }),
            );
        }
        coordinator.set_final_flush(Arc::clone(&flush));

        info!(
            endpoint = %self.config.feed_endpoint(),
            flush_ms = self.config.recorder.flush_interval_ms,
            checkpoint_ms = self.config.recorder.checkpoint_interval_ms,
            "monitor started"
        );

        RunningMonitor {
            coordinator,
            reader,
            flush,
            checkpoints,
        }
    }
}
