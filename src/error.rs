use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Buffer lifetime violation: {0}")]
    LifetimeViolation(String),

    #[error("Unsupported shape: {0}")]
    UnsupportedShape(String),

    #[error("Allocator exhausted: {0}")]
    AllocatorExhausted(String),

    #[error("Invalid allocator state: {0}")]
    InvalidAllocatorState(String),
}
