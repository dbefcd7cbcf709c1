//! Error taxonomy surfaced by the façade.

use thiserror::Error;

use crate::vfs::FsError;

/// Errors returned by the transport, proxy and runner layers.
///
/// Lower layers translate their own failures into one of these variants
/// before returning, so callers never see a raw transport error.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Establishing or keeping the authenticated connection failed
    #[error("connection error: {0}")]
    Connection(String),
    /// The local private key could not be loaded
    #[error("identity error: {0}")]
    Identity(String),
    /// No remote environment is currently running
    #[error("no active session; start a challenge first")]
    NoActiveSession,
    /// Remote path does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Remote side rejected the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Remote file exists but the user may not read it
    #[error("permission to read {0} denied")]
    ReadDenied(String),
    /// Malformed or unexpected response from the remote side
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Operation is only valid from a local (non-remote) context
    #[error("please run this locally instead of inside the remote environment")]
    WrongContext,
    /// Path exists but is not a regular file
    #[error("not a file: {0}")]
    NotAFile(String),
    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FsError> for RemoteError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(p) => RemoteError::NotFound(p),
            FsError::PermissionDenied(p) => RemoteError::PermissionDenied(p),
            FsError::Protocol(msg) => RemoteError::Protocol(msg),
            FsError::Failure(msg) => RemoteError::Protocol(msg),
            FsError::Unsupported(op) => RemoteError::Protocol(format!("unsupported: {op}")),
            FsError::Io(e) => RemoteError::Io(e),
        }
    }
}

impl From<russh::Error> for RemoteError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect
            | russh::Error::HUP
            | russh::Error::ConnectionTimeout
            | russh::Error::IO(_) => RemoteError::Connection(err.to_string()),
            other => RemoteError::Protocol(other.to_string()),
        }
    }
}
