use thiserror::Error;

/// Errors produced by the outpost protocol layer.
#[derive(Debug, Error)]
pub enum OutpostError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session closed")]
    SessionClosed,

    #[error("host already bound: {0}")]
    AlreadyBound(String),

    #[error("no tunnel for host: {0}")]
    NoTunnel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for OutpostError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        OutpostError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for OutpostError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        OutpostError::Codec(e.to_string())
    }
}

pub type OutpostResult<T> = Result<T, OutpostError>;
