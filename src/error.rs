use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for response to {key}")]
    Timeout { key: String },

    #[error("{0}")]
    Nack(String),

    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("unknown state variable: {0}")]
    UnknownVariable(String),
    #[error("type mismatch for {name}: expected {expected}")]
    TypeMismatch { name: String, expected: String },
    #[error("state variable {0} is not editable")]
    ReadOnly(String),
    #[error("device engine is not running")]
    Closed,
}

impl LinkError {
    /// True for failures that came back from the device rather than from the link.
    #[must_use]
    pub const fn is_device_rejection(&self) -> bool {
        matches!(self, Self::Nack(_))
    }
}
