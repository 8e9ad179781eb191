//! Feed connection lifecycle.
//!
//! [`FeedConnector`] opens a subscribed session with a retry policy.
//! [`FeedReader`] drives the long-lived session: it appends a `connect`
//! record on every open and a `disconnect` record whenever the session ends,
//! normalizes everything in between into the change log, and reconnects until
//! shutdown is requested.
//!
//! State machine:
//!
//! ```text
//! Connecting -> Connected -> Reconnecting -> Connected -> ...
//!     |             |              |
//!     +-------------+--------------+--> Draining -> Closed
//! ```

use super::transport::{FeedSession, FeedTransport};
use crate::error::FeedError;
use crate::models::{now_ms, BookChange, Reason};
use crate::normalize::{EventNormalizer, NormalizeMode};
use crate::recorder::ChangeLogBuffer;
use crate::shutdown::ShutdownSignal;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on the close handshake; a silent peer must not stall shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Reconnecting => write!(f, "RECONNECTING"),
            ConnectionState::Draining => write!(f, "DRAINING"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Startup,
    SessionOpened,
    ReadFailed,
    ShutdownRequested,
    Stopped,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::Startup => write!(f, "startup"),
            TransitionReason::SessionOpened => write!(f, "session_opened"),
            TransitionReason::ReadFailed => write!(f, "read_failed"),
            TransitionReason::ShutdownRequested => write!(f, "shutdown_requested"),
            TransitionReason::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Default)]
pub struct FeedStats {
    pub connects_attempted: AtomicU64,
    pub connects_succeeded: AtomicU64,
    pub connects_failed: AtomicU64,
    pub reconnects: AtomicU64,
    pub messages: AtomicU64,
    pub changes: AtomicU64,
}

impl FeedStats {
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} failed={} reconnects={} messages={} changes={}",
            self.connects_succeeded.load(Ordering::Relaxed),
            self.connects_attempted.load(Ordering::Relaxed),
            self.connects_failed.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.messages.load(Ordering::Relaxed),
            self.changes.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Keep trying until shutdown.
    Unlimited,
    /// Give up after `max_attempts` failed opens.
    Bounded { max_attempts: u32 },
}

pub enum OpenOutcome {
    Opened(Box<dyn FeedSession>),
    Exhausted { attempts: u32, last_error: FeedError },
    Cancelled,
}

/// Opens subscribed sessions against one endpoint.
pub struct FeedConnector {
    transport: Arc<dyn FeedTransport>,
    endpoint: String,
    subscribe: Option<String>,
    retry_interval: Duration,
    stats: Arc<FeedStats>,
}

impl FeedConnector {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        endpoint: impl Into<String>,
        subscribe: Option<String>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            subscribe,
            retry_interval,
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }

    /// Open a session, retrying at a fixed interval per `policy`.
    ///
    /// The stop request is checked before every attempt and interrupts both
    /// an attempt in flight and the wait between attempts.
    pub async fn open(&self, policy: RetryPolicy, shutdown: &mut ShutdownSignal) -> OpenOutcome {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_requested() {
                return OpenOutcome::Cancelled;
            }
            attempt += 1;
            self.stats.connects_attempted.fetch_add(1, Ordering::Relaxed);

            let result = tokio::select! {
                _ = shutdown.wait() => return OpenOutcome::Cancelled,
                result = self.try_open() => result,
            };

            let err = match result {
                Ok(session) => {
                    self.stats.connects_succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint = %self.endpoint, attempt, "feed session opened");
                    return OpenOutcome::Opened(session);
                }
                Err(e) => e,
            };

            self.stats.connects_failed.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %self.endpoint, attempt, error = %err, "feed connect failed");

            if let RetryPolicy::Bounded { max_attempts } = policy {
                if attempt >= max_attempts {
                    return OpenOutcome::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    };
                }
            }

            tokio::select! {
                _ = shutdown.wait() => return OpenOutcome::Cancelled,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Close `session`, giving up after [`CLOSE_TIMEOUT`].
    pub async fn close(&self, session: &mut dyn FeedSession, reason: &str) {
        if tokio::time::timeout(CLOSE_TIMEOUT, session.close(reason))
            .await
            .is_err()
        {
            debug!(endpoint = %self.endpoint, reason, "close handshake timed out");
        }
    }

    /// One attempt: open plus subscribe handshake.
    async fn try_open(&self) -> Result<Box<dyn FeedSession>, FeedError> {
        let mut session = self.transport.open(&self.endpoint).await?;
        if let Some(subscribe) = &self.subscribe {
            if let Err(e) = session.send_text(subscribe.clone()).await {
                self.close(session.as_mut(), "subscribe failed").await;
                return Err(e);
            }
        }
        Ok(session)
    }
}

// =============================================================================
// READER
// =============================================================================

enum SessionEnd {
    Shutdown,
    Failed(FeedError),
}

/// Long-lived feed worker.
pub struct FeedReader {
    connector: FeedConnector,
    normalizer: EventNormalizer,
    buffer: Arc<ChangeLogBuffer>,
    state: RwLock<ConnectionState>,
}

impl FeedReader {
    pub fn new(connector: FeedConnector, buffer: Arc<ChangeLogBuffer>) -> Self {
        Self {
            connector,
            normalizer: EventNormalizer::new(NormalizeMode::Stream),
            buffer,
            state: RwLock::new(ConnectionState::Connecting),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        self.connector.stats()
    }

    pub fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    fn transition(&self, new_state: ConnectionState, reason: TransitionReason) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }
        if new_state == ConnectionState::Reconnecting {
            self.stats().reconnects.fetch_add(1, Ordering::Relaxed);
        }
        info!(from = %old_state, to = %new_state, reason = %reason, "feed_transition");
    }

    fn append_lifecycle(&self, reason: Reason) -> u64 {
        self.buffer.append(BookChange::lifecycle(now_ms(), reason))
    }

    /// Run until shutdown. Returns once the session is closed.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        self.transition(ConnectionState::Connecting, TransitionReason::Startup);

        loop {
            let mut session = match self
                .connector
                .open(RetryPolicy::Unlimited, &mut shutdown)
                .await
            {
                OpenOutcome::Opened(session) => session,
                OpenOutcome::Cancelled => break,
                OpenOutcome::Exhausted { last_error, .. } => {
                    error!(error = %last_error, "feed connect retries exhausted");
                    break;
                }
            };

            let seq = self.append_lifecycle(Reason::Connect);
            self.transition(ConnectionState::Connected, TransitionReason::SessionOpened);
            debug!(sequence_id = seq, "connect recorded");

            match self.stream(session.as_mut(), &mut shutdown).await {
                SessionEnd::Shutdown => {
                    self.transition(ConnectionState::Draining, TransitionReason::ShutdownRequested);
                    self.connector
                        .close(session.as_mut(), "client shutdown")
                        .await;
                    self.append_lifecycle(Reason::Disconnect);
                    break;
                }
                SessionEnd::Failed(e) => {
                    warn!(error = %e, "feed session lost");
                    self.append_lifecycle(Reason::Disconnect);
                    if shutdown.is_requested() {
                        self.transition(
                            ConnectionState::Draining,
                            TransitionReason::ShutdownRequested,
                        );
                        break;
                    }
                    self.transition(ConnectionState::Reconnecting, TransitionReason::ReadFailed);
                }
            }
        }

        self.transition(ConnectionState::Closed, TransitionReason::Stopped);
        info!(
            feed = %self.stats().summary(),
            normalizer = %self.normalizer.stats().summary(),
            "feed reader stopped"
        );
    }

    async fn stream(
        &self,
        session: &mut dyn FeedSession,
        shutdown: &mut ShutdownSignal,
    ) -> SessionEnd {
        loop {
            let received = tokio::select! {
                _ = shutdown.wait() => return SessionEnd::Shutdown,
                received = session.receive() => received,
            };

            match received {
                Ok(raw) => {
                    self.stats().messages.fetch_add(1, Ordering::Relaxed);
                    let changes = self.normalizer.normalize(&raw);
                    if !changes.is_empty() {
                        let n = self.buffer.append_all(changes);
                        self.stats().changes.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }
}
