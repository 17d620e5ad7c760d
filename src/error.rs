//! Error taxonomy shared by the pipeline stages, the query engine, and the
//! HTTP surface.
//!
//! Storage and provider adapters report failures as [`anyhow::Error`]; at
//! the service boundary these become [`Error::Dependency`]. The other
//! variants are raised deliberately by the component that detects them.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed input; correctable by the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown document, or no recorded status for it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The extraction stage cannot handle this MIME type.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Blob store, metadata store, index, or provider unavailable or erroring.
    #[error("dependency error: {0:#}")]
    Dependency(#[from] anyhow::Error),

    /// Query-time embedding failure.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Query-time generation failure.
    #[error("generation error: {0}")]
    Generation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Only dependency failures are worth redelivering; everything else
    /// would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Dependency(_))
    }

    /// Name recorded on the status snapshot and surfaced to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::NotFound(_) => "NotFoundError",
            Error::UnsupportedFormat(_) => "UnsupportedFormatError",
            Error::Dependency(_) => "DependencyError",
            Error::Retrieval(_) => "RetrievalError",
            Error::Generation(_) => "GenerationError",
        }
    }

    /// The error text without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Error::Validation(m)
            | Error::NotFound(m)
            | Error::UnsupportedFormat(m)
            | Error::Retrieval(m)
            | Error::Generation(m) => m.clone(),
            Error::Dependency(e) => format!("{:#}", e),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Dependency(e.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Dependency(e.into())
    }
}

/// Runs `fut` with an upper bound; exceeding it is reported as a
/// dependency failure so callers follow the normal error path.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Dependency(anyhow::anyhow!(
            "{} timed out after {}s",
            what,
            limit.as_secs_f64()
        ))),
    }
}
