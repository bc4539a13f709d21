pub mod engine;
pub mod ring;

pub use engine::{MetricsEngine, RealtimeRates};
pub use ring::{MetricDataPoint, RingBuffer, WindowAverage, WindowTotals};
