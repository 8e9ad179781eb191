//! Exchange feed connectivity.

pub mod connection;
pub mod transport;

pub use connection::{
    ConnectionState, FeedConnector, FeedReader, FeedStats, OpenOutcome, RetryPolicy,
};
pub use transport::{FeedSession, FeedTransport, WsTransport};
