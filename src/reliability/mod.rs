pub mod circuit_breaker;
pub mod dead_letter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use dead_letter::{DeadLetterConfig, DeadLetterError, DeadLetterStore};
pub use retry::{DEFAULT_RETRY_DELAY, RetryConfig, RetryPolicy, RetryStrategy};
