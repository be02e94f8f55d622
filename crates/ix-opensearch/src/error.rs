use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenSearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected index result: {0}")]
    UnexpectedResult(String),
}
