//! File-transfer sub-channel abstraction

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Errors that can occur during remote filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    /// Path does not exist on the remote side
    #[error("file not found: {0}")]
    NotFound(String),
    /// Remote side rejected the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Malformed or unexpected response from the remote side
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Remote side reported a generic failure (exists, not empty, ...)
    #[error("operation failed: {0}")]
    Failure(String),
    /// Operation not supported by this backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// OS error code handed to the userspace filesystem driver.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::Protocol(_) | FsError::Failure(_) => libc::EIO,
            FsError::Unsupported(_) => libc::ENOSYS,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Kind of a remote entry, derived from the mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Device, socket, fifo or anything else
    Other,
}

impl FileKind {
    /// Classify a full `st_mode` value.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFREG => FileKind::File,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }

    /// File-type bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Directory => S_IFDIR,
            FileKind::File => S_IFREG,
            FileKind::Symlink => S_IFLNK,
            FileKind::Other => 0,
        }
    }
}

/// Attributes exactly as the remote reports them. Times are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttributes {
    /// Full mode including file-type bits
    pub mode: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Last access time as Unix timestamp
    pub atime: u64,
    /// Last modification time as Unix timestamp
    pub mtime: u64,
}

impl RemoteAttributes {
    /// Kind of entry these attributes describe.
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }
}

/// Primitive operations offered by a file-transfer sub-channel.
///
/// Relative paths are resolved against the channel's working directory.
#[async_trait]
pub trait FileChannel: Send + Sync {
    /// Attributes of `path`, following symlinks
    async fn stat(&self, path: &str) -> Result<RemoteAttributes, FsError>;

    /// Attributes of `path` itself, not following symlinks
    async fn lstat(&self, path: &str) -> Result<RemoteAttributes, FsError>;

    /// Entry names in a directory, without `.` and `..`
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError>;

    /// Read up to `size` bytes starting at `offset`
    async fn read_at(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>, FsError>;

    /// Write `data` at `offset` into an existing file
    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError>;

    /// Create (or truncate) a file and apply `mode`
    async fn create(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Read a whole file
    async fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError>;

    /// Replace a file's contents, creating it if needed
    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), FsError>;

    /// Create a directory
    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &str) -> Result<(), FsError>;

    /// Remove a file or symlink
    async fn unlink(&self, path: &str) -> Result<(), FsError>;

    /// Rename `from` to `to`
    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    /// Create a symlink at `link` pointing to `target`
    async fn symlink(&self, link: &str, target: &str) -> Result<(), FsError>;

    /// Target of the symlink at `path`
    async fn readlink(&self, path: &str) -> Result<String, FsError>;

    /// Change permission bits
    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Change owner and group
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError>;

    /// Set the file length
    async fn truncate(&self, path: &str, length: u64) -> Result<(), FsError>;

    /// Set access and modification times, in seconds
    async fn set_times(&self, path: &str, atime: u64, mtime: u64) -> Result<(), FsError>;

    /// Copy a remote file to a local path, returning bytes copied
    async fn download(&self, remote: &str, local: &Path) -> Result<u64, FsError>;

    /// Copy a local file to a remote path, returning bytes copied
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, FsError>;

    /// Close the sub-channel
    async fn close(&self) -> Result<(), FsError>;
}

/// Join a remote directory path and an entry name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "." {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o100644), FileKind::File);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o020666), FileKind::Other);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("a".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::PermissionDenied("a".into()).errno(), libc::EACCES);
        assert_eq!(FsError::Protocol("bad".into()).errno(), libc::EIO);
        assert_eq!(FsError::Unsupported("x".into()).errno(), libc::ENOSYS);
        let io = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(FsError::Io(io).errno(), libc::ENOSPC);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path(".", "a"), "a");
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("dir/sub", "f"), "dir/sub/f");
    }
}
