//! Transport error type.

use std::time::Duration;

/// Failures of a streaming feed session.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("send failed: {0}")]
    Send(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("connection closed by peer: {0}")]
    Closed(String),

    #[error("timed out waiting for {what} after {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },
}
