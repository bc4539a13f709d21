use thiserror::Error;

use crate::domain::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Queue is full")]
    Full,

    #[error("Queue is closed")]
    Closed,

    #[error("Invalid queue capacity: {capacity}")]
    InvalidCapacity { capacity: usize },
}

impl BufferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BufferError::Full | BufferError::Closed => ErrorKind::Capacity,
            BufferError::InvalidCapacity { .. } => ErrorKind::Configuration,
        }
    }
}
