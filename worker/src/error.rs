//! Worker-side error type.

/// Anything that can go wrong while loading a dataset or encoding a chunk.
///
/// The variant text ends up verbatim in the `reason` field of a failed
/// load-status record, so messages are written for API users, not
/// operators.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode dataset: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no dataset reader for scheme {0}")]
    UnsupportedScheme(String),
    #[error("{0}")]
    InvalidDataset(String),
    #[error("no such variable: {0}")]
    UnknownVariable(String),
    #[error("invalid chunk id {0}")]
    InvalidChunk(String),
    #[error("cache unavailable: {0}")]
    Cache(#[from] redis::RedisError),
}
