use std::io;
use std::path::PathBuf;

/// Errors raised while talking to the container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to connect to docker socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Docker request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid docker request: {0}")]
    Request(#[from] http::Error),

    #[error("Docker returned {status} for {path}: {message}")]
    Status {
        status: u16,
        path: String,
        message: String,
    },

    #[error("Failed to decode docker response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to encode docker query: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),

    #[error("Docker stream error: {0}")]
    Io(#[from] io::Error),
}

impl From<tokio_util::codec::LinesCodecError> for RuntimeError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::Io(e) => Self::Io(e),
            other => Self::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}
