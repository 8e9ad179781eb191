//! Change log buffering and the two persistence workers.

pub mod buffer;
pub mod checkpoint;
pub mod flush;

pub use buffer::ChangeLogBuffer;
pub use checkpoint::{CheckpointOutcome, CheckpointScheduler, CheckpointStats};
pub use flush::{FlushScheduler, FlushStats};
