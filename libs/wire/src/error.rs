use thiserror::Error;

/// Errors raised while decoding or validating wire payloads.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid event line: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    #[error("invalid run request: {0}")]
    InvalidRequest(String),
}

pub type WireResult<T> = Result<T, WireError>;
