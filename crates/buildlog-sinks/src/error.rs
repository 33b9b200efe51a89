/// Errors raised by sinks and their adapters
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Missing sink configuration: {0}")]
    MissingConfig(&'static str),

    #[error("Sink type {0} is not implemented")]
    UnknownKind(String),

    #[error("No sink configured")]
    NoSinks,

    #[error("Sink writer is not running")]
    WriterClosed,

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Firebase request failed: {0}")]
    Http(#[from] reqwest::Error),
}
