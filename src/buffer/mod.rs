pub mod batch;
pub mod error;
pub mod queue;

pub use batch::{BatchCollector, BatchConfig, DEFAULT_FLUSH_INTERVAL};
pub use error::BufferError;
pub use queue::{QueueReceiver, QueueSender, QueueStats, bounded};
