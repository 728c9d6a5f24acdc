//! Server error types.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key error: {0}")]
    Key(#[from] russh::keys::ssh_key::Error),

    #[error("key file error: {0}")]
    KeyFile(#[from] russh::keys::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("host already in use")]
    Conflict,

    #[error("random name pool exhausted")]
    Exhausted,
}
