pub mod error;
pub mod event;
pub mod metrics;
pub mod source;

pub use error::{ConfigError, ErrorKind};
pub use event::{Batch, LogEvent, Payload};
pub use metrics::{CircuitState, DestinationMetrics, GlobalMetrics, SourceMetrics};
pub use source::{
    AggregationRule, DestinationConfig, DestinationKind, FilterAction, FilterOperator, FilterRule,
    HecConfig, HecFormat, Protocol, SourceConfig, StorageConfig, WILDCARD_IP,
};
