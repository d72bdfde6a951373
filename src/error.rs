use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarginError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport failure while contacting {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Balance service returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Balance request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Balance response carried no payload: {0}")]
    MissingPayload(String),

    #[error("Malformed balance document: {0}")]
    Parse(String),

    #[error("Roll-up group '{group}' is missing account {account}")]
    Aggregation { group: String, account: String },

    #[error("Amount out of range while computing {0}")]
    Overflow(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MarginError {
    /// True for every failure that happened while obtaining a document from the
    /// balance service, as opposed to a failure interpreting it.
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::HttpStatus { .. } | Self::Timeout(_) | Self::MissingPayload(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MarginError>;
