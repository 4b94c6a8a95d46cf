use thiserror::Error;

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    /// The streaming request cache is full
    #[error("maximum number of in-flight requests exceeded")]
    TooManyInFlight,

    /// No unique token could be drawn
    #[error("failed to generate unique token: {0}")]
    TokenGeneration(String),

    /// Unknown, expired or mismatched resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied a malformed request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Container runtime collaborator failed
    #[error("Runtime error: {target}: {message}")]
    Runtime { target: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BerthError {
    /// Wrap a runtime failure with the identifiers it concerns.
    pub fn runtime(target: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BerthError::Runtime {
            target: target.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BerthError {
    fn from(err: serde_yaml::Error) -> Self {
        BerthError::Serialization(err.to_string())
    }
}

/// Result type alias for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;
