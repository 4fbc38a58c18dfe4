use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The host key file could not be read.
    #[error("Failed to read host key {}: {source}", path.display())]
    KeyRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The host key file is not a supported private key.
    #[error("Failed to parse host key {}: {source}", path.display())]
    KeyParse {
        path: PathBuf,
        source: russh::keys::Error,
    },

    /// No temporary host key could be generated.
    #[error("Failed to generate temporary private key: {0}")]
    KeyGen(#[source] russh::keys::ssh_key::Error),

    /// The listen address did not resolve to anything.
    #[error("Failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        source: std::io::Error,
    },

    /// The listening socket could not be bound.
    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Version exchange, key exchange or authentication failed.
    #[error(transparent)]
    Handshake(#[from] russh::Error),

    /// The handshake did not finish within the configured bound.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// The client went away before authenticating.
    #[error("Connection closed before authentication")]
    HandshakeIncomplete,
}
