use thiserror::Error;

/// Result type for tank-rl operations
pub type Result<T> = std::result::Result<T, TankRlError>;

/// Main error type for the learner, its persistence layer and the bridge
#[derive(Error, Debug)]
pub enum TankRlError {
    /// Invalid dimensions for operations
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    /// Invalid parameter value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO errors (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Non-finite values in a computation
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Empty buffer or container
    #[error("Empty buffer: {0}")]
    EmptyBuffer(String),

    /// Invalid action
    #[error("Invalid action {action}: must be less than {max_actions}")]
    InvalidAction { action: usize, max_actions: usize },

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Remote snapshot store failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// The learner thread is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<bincode::Error> for TankRlError {
    fn from(err: bincode::Error) -> Self {
        TankRlError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TankRlError {
    fn from(err: serde_json::Error) -> Self {
        TankRlError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TankRlError {
    fn from(err: toml::de::Error) -> Self {
        TankRlError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for TankRlError {
    fn from(err: base64::DecodeError) -> Self {
        TankRlError::Serialization(format!("weight blob: {}", err))
    }
}

impl From<reqwest::Error> for TankRlError {
    fn from(err: reqwest::Error) -> Self {
        TankRlError::Transport(err.to_string())
    }
}

// Helper functions for common error patterns
impl TankRlError {
    pub fn dimension_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        TankRlError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(name: S, reason: S) -> Self {
        TankRlError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
