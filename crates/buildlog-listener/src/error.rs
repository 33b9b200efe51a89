use buildlog_sinks::SinkError;

/// Configuration errors that keep the router from starting
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Logger id is not configured")]
    MissingLoggerId,

    #[error(transparent)]
    Sink(#[from] SinkError),
}
