//! Authenticated connection to the remote host and its sub-channels.
//!
//! This module provides:
//! - `Transport` - One connection that opens exec, PTY and file-transfer channels
//! - `Channel` - Duplex byte stream for a single command or shell
//! - `SessionPool` - Single-slot pool that connects lazily and shares the connection
//! - `SshConnector` / `SshTransport` - The SSH implementation

mod pool;
mod ssh;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::vfs::FileChannel;

pub use pool::SessionPool;
pub use ssh::{SshChannel, SshConnector, SshTransport};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    /// Columns
    pub cols: u16,
    /// Rows
    pub rows: u16,
}

impl Default for TermSize {
    /// 80x24, used when the local size cannot be determined.
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A duplex byte stream to one remote command or shell.
#[async_trait]
pub trait Channel: Send {
    /// Whether a pseudo-terminal backs this channel
    fn is_pty(&self) -> bool;

    /// Read up to `max` bytes. `None` means the remote side closed.
    ///
    /// Must be cancel-safe: dropping the future before completion loses no
    /// data.
    async fn read(&mut self, max: usize) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Send bytes to the remote side
    async fn write_all(&mut self, data: &[u8]) -> Result<(), RemoteError>;

    /// Resize the pseudo-terminal
    async fn resize(&mut self, size: TermSize) -> Result<(), RemoteError>;

    /// Close the channel
    async fn close(&mut self) -> Result<(), RemoteError>;
}

/// One authenticated connection to the remote host.
///
/// Every sub-channel shares the connection; opening channels never
/// reconnects.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a plain channel running `command`, or a login shell when `None`
    async fn open_exec(&self, command: Option<&str>) -> Result<Box<dyn Channel>, RemoteError>;

    /// Open a PTY-backed channel of the given terminal type and size
    async fn open_pty(
        &self,
        term: &str,
        size: TermSize,
        command: Option<&str>,
    ) -> Result<Box<dyn Channel>, RemoteError>;

    /// Open, or reuse, the file-transfer sub-channel
    async fn open_file_channel(&self) -> Result<Arc<dyn FileChannel>, RemoteError>;

    /// Close every sub-channel and disconnect
    async fn close(&self) -> Result<(), RemoteError>;
}

/// Establishes new [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate
    async fn connect(&self) -> Result<Arc<dyn Transport>, RemoteError>;
}
