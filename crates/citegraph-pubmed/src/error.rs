use citegraph_core::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubMedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error from {0}: {1}")]
    ApiError(String, String),

    #[error("rate limit from {0}, retry after {1}s")]
    RateLimit(String, u64),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}

impl PubMedError {
    /// Store-unavailable errors halt a completion cycle; everything else is
    /// confined to the item that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Graph(err) if err.is_unavailable())
    }
}

pub type Result<T> = std::result::Result<T, PubMedError>;
