//! Remote project filesystem.
//!
//! This module provides:
//! - `FileChannel` - Primitive file-transfer operations (SFTP or in-memory)
//! - `VirtualFilesystem` - Path-level operations with attribute conversion
//! - `FuseAdapter` - Bridge from the userspace filesystem driver to `FsOperations`
//!
//! Paths are relative to the remote project directory unless absolute.

mod channel;
mod filesystem;
mod fuse;
mod memory;
mod ops;
mod sftp;

pub use channel::*;
pub use filesystem::{Attributes, TimeUnit, VirtualFilesystem};
pub use fuse::{FuseAdapter, MountStatus, mount};
pub use memory::MemoryFileChannel;
pub use ops::FsOperations;
pub use sftp::SftpChannel;
