//! Dojo Bridge: work against a remote Linux host as though it were local
//!
//! One authenticated SSH connection carries interactive terminal sessions,
//! captured one-off commands, file transfers, and an SFTP-backed filesystem
//! that can be mounted locally through FUSE.

mod config;
mod error;
mod runner;

pub mod proxy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod vfs;

pub use config::{BridgeConfig, CONFIG_ENV, ConfigError, expand_home};
pub use error::RemoteError;
pub use runner::{
    AUTH_TOKEN_ENV, ExecutionContext, RemoteRunner, RunRequest, SessionProbe, Transfer,
    TransportProbe,
};
