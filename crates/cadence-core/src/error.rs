// Cadence error types
use cadence_types::ValidationIssue;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed")]
    Validation(Vec<ValidationIssue>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict ({code}): {message}")]
    Conflict { code: String, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CadenceError {
    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        CadenceError::Conflict {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        CadenceError::Validation(issues)
    }
}
