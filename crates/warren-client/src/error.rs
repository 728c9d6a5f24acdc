//! Client error types.

use thiserror::Error;

use warren_proto::WireError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("server rejected public key authentication")]
    AuthRejected,

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("control connection lost")]
    ConnectionLost,

    #[error("invalid backend url: {0}")]
    InvalidBackend(String),

    #[error("malformed request head on forwarded channel")]
    MalformedRequest,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
