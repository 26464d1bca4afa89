use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{tool} exited with code {exit_code}: {stderr}")]
    Subprocess {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Integrity check failed: {message}")]
    Integrity { message: String },

    #[error("Partial failure: {detail}")]
    Partial { detail: String },

    #[error("State conflict: {message}")]
    StateConflict { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Artifact not found: {id}")]
    NotFound { id: String },

    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestrationError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::StateConflict {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
