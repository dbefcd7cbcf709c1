//! Operation set a userspace filesystem driver calls into.

use async_trait::async_trait;

use super::channel::FsError;
use super::filesystem::{Attributes, TimeUnit};

/// POSIX-like operations, one method per driver callback.
///
/// Paths are relative to the mounted root. Times are expressed in the
/// implementor's [`TimeUnit`].
#[async_trait]
pub trait FsOperations: Send + Sync {
    /// Unit used for every timestamp crossing this interface
    fn time_unit(&self) -> TimeUnit;

    /// Attributes of `path` (not following a final symlink)
    async fn getattr(&self, path: &str) -> Result<Attributes, FsError>;

    /// Directory entries including `.` and `..`
    async fn readdir(&self, path: &str) -> Result<Vec<String>, FsError>;

    /// Read up to `size` bytes at `offset`
    async fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, FsError>;

    /// Write `data` at `offset`, returning bytes written
    async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, FsError>;

    /// Create an empty file with `mode`
    async fn create(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Create a directory with `mode`
    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &str) -> Result<(), FsError>;

    /// Rename `old` to `new`
    async fn rename(&self, old: &str, new: &str) -> Result<(), FsError>;

    /// Create a symlink at `link` pointing at `target`
    async fn symlink(&self, link: &str, target: &str) -> Result<(), FsError>;

    /// Target of a symlink
    async fn readlink(&self, path: &str) -> Result<String, FsError>;

    /// Change permission bits
    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Change owner and group
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError>;

    /// Set file length
    async fn truncate(&self, path: &str, length: u64) -> Result<(), FsError>;

    /// Set `(atime, mtime)`, or both to now when `None`
    async fn utimens(&self, path: &str, times: Option<(u64, u64)>) -> Result<(), FsError>;

    /// Remove a file or symlink
    async fn unlink(&self, path: &str) -> Result<(), FsError>;

    /// Release resources on unmount
    async fn destroy(&self) -> Result<(), FsError>;
}
