use thiserror::Error;

/// Transport-level failure (poll, commit or publish).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    /// Internal lock poisoning in an in-process transport.
    #[error("transport state poisoned")]
    Poisoned,
}
