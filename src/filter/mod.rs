pub mod aggregator;
pub mod engine;
pub mod field;

pub use aggregator::Aggregator;
pub use engine::FilterEngine;
