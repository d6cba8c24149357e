//! Error types for the query engine.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The dataset does not exist or has no processed rows.
    #[error("dataset not found: {dataset_id}")]
    NotFound { dataset_id: String },

    /// The query descriptor is missing required fields or is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The dataset store failed while loading.
    #[error("dataset store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidQuery(message.into())
    }

    /// True for errors caused by the caller (4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound { .. } | EngineError::InvalidQuery(_)
        )
    }

    /// HTTP-style status code for request/response boundaries.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound { .. } => 404,
            EngineError::InvalidQuery(_) => 400,
            EngineError::Store(_) | EngineError::Internal(_) => 500,
        }
    }

    /// Message safe to hand back to end users. Server-side failures are
    /// logged with full detail and reported generically.
    pub fn public_message(&self) -> String {
        if self.is_client_error() {
            self.to_string()
        } else {
            "internal error while running query".to_string()
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidQuery(format!("malformed descriptor: {}", err))
    }
}
