//! Order-book change feed recorder.
//!
//! Ingests an exchange's order-book change stream, appends every change to a
//! sequenced in-memory log, flushes the log to SQLite on a timer, and takes
//! periodic full-book checkpoints over a separate connection so the book can
//! be rebuilt offline from the nearest checkpoint plus the change log.

pub mod config;
pub mod control;
pub mod error;
pub mod feed;
pub mod models;
pub mod normalize;
pub mod recorder;
pub mod replay;
pub mod service;
pub mod shutdown;
pub mod storage;

pub use config::{ConfigError, MonitorConfig};
pub use error::FeedError;
pub use models::{BookChange, ChangeRecord, CheckpointMarker, Reason, Side};
pub use service::{MonitorService, RunningMonitor};
