use thiserror::Error;

/// Broad failure classes shared by every error type in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid settings, reported at start and never retried.
    Configuration,
    /// Delivery failed in a way a later attempt may fix.
    TransientDelivery,
    /// A bounded queue was full; the item was dropped and counted.
    Capacity,
    /// Payload could not be parsed; it is kept as a raw string.
    Parse,
    /// The listening socket could not be bound.
    ListenerBind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}
