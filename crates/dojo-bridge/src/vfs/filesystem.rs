//! Path-level filesystem over a [`FileChannel`].
//!
//! Adds what the transfer protocol lacks: recursive create, remove and size,
//! plus conversion of timestamps into the unit the driver expects.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use super::channel::{FileChannel, FileKind, FsError, RemoteAttributes, join_path};
use super::ops::FsOperations;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Mode used for directories created by [`VirtualFilesystem::makedirs`]
const MAKEDIRS_MODE: u32 = 0o755;

/// Unit of timestamps at the driver boundary.
///
/// The remote side always stores seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    /// Whole seconds since the epoch
    Seconds,
    /// Nanoseconds since the epoch
    #[default]
    Nanoseconds,
}

impl TimeUnit {
    /// Pick the unit from the `timestamps_in_nanoseconds` setting.
    pub fn from_nanoseconds_flag(nanoseconds: bool) -> Self {
        if nanoseconds {
            TimeUnit::Nanoseconds
        } else {
            TimeUnit::Seconds
        }
    }

    /// Convert remote seconds into this unit.
    pub fn of_remote(self, secs: u64) -> u64 {
        match self {
            TimeUnit::Seconds => secs,
            TimeUnit::Nanoseconds => secs.saturating_mul(NANOS_PER_SEC),
        }
    }

    /// Convert a value in this unit into remote seconds, truncating.
    pub fn to_remote(self, value: u64) -> u64 {
        match self {
            TimeUnit::Seconds => value,
            TimeUnit::Nanoseconds => value / NANOS_PER_SEC,
        }
    }

    /// Interpret a value in this unit as a point in time.
    pub fn to_system_time(self, value: u64) -> SystemTime {
        let offset = match self {
            TimeUnit::Seconds => Duration::from_secs(value),
            TimeUnit::Nanoseconds => Duration::from_nanos(value),
        };
        UNIX_EPOCH + offset
    }

    /// Express a point in time in this unit. Times before the epoch become 0.
    pub fn of_system_time(self, time: SystemTime) -> u64 {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        match self {
            TimeUnit::Seconds => since.as_secs(),
            TimeUnit::Nanoseconds => u64::try_from(since.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

/// Attributes handed to the driver, times in the filesystem's [`TimeUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Full mode including file-type bits
    pub mode: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Last access time
    pub atime: u64,
    /// Last modification time
    pub mtime: u64,
}

impl Attributes {
    fn from_remote(attrs: RemoteAttributes, unit: TimeUnit) -> Self {
        Self {
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            size: attrs.size,
            atime: unit.of_remote(attrs.atime),
            mtime: unit.of_remote(attrs.mtime),
        }
    }

    /// Kind of entry.
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }
}

/// Remote project tree exposed as a filesystem.
#[derive(Clone)]
pub struct VirtualFilesystem {
    channel: Arc<dyn FileChannel>,
    unit: TimeUnit,
}

impl std::fmt::Debug for VirtualFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFilesystem")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

impl VirtualFilesystem {
    /// Create a filesystem over `channel` reporting times in `unit`.
    pub fn new(channel: Arc<dyn FileChannel>, unit: TimeUnit) -> Self {
        Self { channel, unit }
    }

    /// Underlying file channel.
    pub fn channel(&self) -> &Arc<dyn FileChannel> {
        &self.channel
    }

    /// Whether `path` is a regular file (following symlinks).
    pub async fn is_file(&self, path: &str) -> Result<bool, FsError> {
        self.is_kind(path, FileKind::File).await
    }

    /// Whether `path` is a directory (following symlinks).
    pub async fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        self.is_kind(path, FileKind::Directory).await
    }

    async fn is_kind(&self, path: &str, kind: FileKind) -> Result<bool, FsError> {
        match self.channel.stat(path).await {
            Ok(attrs) => Ok(attrs.kind() == kind),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Entry names of a directory, without `.` and `..`.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        self.channel.list_dir(path).await
    }

    /// Create `path` and any missing ancestors. Safe to call repeatedly.
    pub async fn makedirs(&self, path: &str) -> Result<(), FsError> {
        for ancestor in ancestors(path) {
            if !self.is_dir(&ancestor).await? {
                debug!(path = %ancestor, "creating directory");
                self.channel.mkdir(&ancestor, MAKEDIRS_MODE).await?;
            }
        }
        Ok(())
    }

    /// Remove `path` and everything beneath it. A missing path is not an error.
    pub fn remove_recursive<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            let attrs = match self.channel.lstat(path).await {
                Ok(attrs) => attrs,
                Err(FsError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if attrs.kind() != FileKind::Directory {
                return self.channel.unlink(path).await;
            }
            for name in self.channel.list_dir(path).await? {
                let child = join_path(path, &name);
                self.remove_recursive(&child).await?;
            }
            self.channel.rmdir(path).await
        }
        .boxed()
    }

    /// Total size of `path` in bytes.
    ///
    /// Directories sum their entries. Anything that is neither a file nor a
    /// directory, including a missing path, counts as -1.
    pub fn size_of<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<i64, FsError>> {
        async move {
            let attrs = match self.channel.stat(path).await {
                Ok(attrs) => attrs,
                Err(FsError::NotFound(_)) => return Ok(-1),
                Err(e) => return Err(e),
            };
            match attrs.kind() {
                FileKind::File => Ok(i64::try_from(attrs.size).unwrap_or(i64::MAX)),
                FileKind::Directory => {
                    let mut total = 0i64;
                    for name in self.channel.list_dir(path).await? {
                        let child = join_path(path, &name);
                        total = total.saturating_add(self.size_of(&child).await?);
                    }
                    Ok(total)
                }
                _ => Ok(-1),
            }
        }
        .boxed()
    }

    /// Whole contents of a remote file.
    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.channel.read_all(path).await
    }

    /// Replace a remote file's contents.
    pub async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.channel.write_all(path, data).await
    }

    /// Copy a remote file to a local path.
    pub async fn download(&self, remote: &str, local: &Path) -> Result<u64, FsError> {
        self.channel.download(remote, local).await
    }

    /// Copy a local file to a remote path.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<u64, FsError> {
        self.channel.upload(local, remote).await
    }
}

/// Every prefix of `path` from the top down, ending with `path` itself.
fn ancestors(path: &str) -> Vec<String> {
    let mut current = if path.starts_with('/') {
        "/".to_string()
    } else {
        String::new()
    };
    let mut out = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        current = join_path(&current, component);
        out.push(current.clone());
    }
    out
}

#[async_trait]
impl FsOperations for VirtualFilesystem {
    fn time_unit(&self) -> TimeUnit {
        self.unit
    }

    async fn getattr(&self, path: &str) -> Result<Attributes, FsError> {
        let attrs = self.channel.lstat(path).await.map_err(|e| match e {
            FsError::NotFound(_) => FsError::NotFound(path.to_string()),
            other => other,
        })?;
        Ok(Attributes::from_remote(attrs, self.unit))
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let mut entries = vec![".".to_string(), "..".to_string()];
        entries.extend(self.channel.list_dir(path).await?);
        Ok(entries)
    }

    async fn read(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        self.channel.read_at(path, offset, size).await
    }

    async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, FsError> {
        self.channel.write_at(path, offset, data).await
    }

    async fn create(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.channel.create(path, mode).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.channel.mkdir(path, mode).await
    }

    async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.channel.rmdir(path).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        self.channel.rename(old, new).await
    }

    async fn symlink(&self, link: &str, target: &str) -> Result<(), FsError> {
        self.channel.symlink(link, target).await
    }

    async fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.channel.readlink(path).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.channel.chmod(path, mode).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        self.channel.chown(path, uid, gid).await
    }

    async fn truncate(&self, path: &str, length: u64) -> Result<(), FsError> {
        self.channel.truncate(path, length).await
    }

    async fn utimens(&self, path: &str, times: Option<(u64, u64)>) -> Result<(), FsError> {
        let (atime, mtime) = match times {
            Some((atime, mtime)) => (self.unit.to_remote(atime), self.unit.to_remote(mtime)),
            None => {
                let now = TimeUnit::Seconds.of_system_time(SystemTime::now());
                (now, now)
            }
        };
        self.channel.set_times(path, atime, mtime).await
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.channel.unlink(path).await
    }

    async fn destroy(&self) -> Result<(), FsError> {
        self.channel.close().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFileChannel;

    fn vfs(channel: MemoryFileChannel, unit: TimeUnit) -> VirtualFilesystem {
        VirtualFilesystem::new(Arc::new(channel), unit)
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("a/b/c"), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(ancestors("/srv/x"), vec!["/srv", "/srv/x"]);
        assert_eq!(ancestors("./a//b/"), vec!["a", "a/b"]);
        assert!(ancestors(".").is_empty());
    }

    #[test]
    fn test_time_unit_conversion() {
        let unit = TimeUnit::Nanoseconds;
        assert_eq!(unit.of_remote(3), 3_000_000_000);
        assert_eq!(unit.to_remote(3_999_999_999), 3);
        assert_eq!(TimeUnit::Seconds.to_remote(17), 17);
        assert_eq!(
            unit.to_system_time(1_500_000_000),
            UNIX_EPOCH + Duration::from_millis(1500)
        );
    }

    #[tokio::test]
    async fn test_getattr_missing_is_not_found() {
        let fs = vfs(MemoryFileChannel::new(), TimeUnit::Seconds);
        let err = fs.getattr("nope").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(p) if p == "nope"));
        assert_eq!(err_code(&fs, "nope").await, libc::ENOENT);
    }

    async fn err_code(fs: &VirtualFilesystem, path: &str) -> i32 {
        fs.getattr(path).await.unwrap_err().errno()
    }

    #[tokio::test]
    async fn test_getattr_does_not_follow_symlink() {
        let channel = MemoryFileChannel::new()
            .with_dir("target")
            .with_symlink("link", "target");
        let fs = vfs(channel, TimeUnit::Seconds);
        assert_eq!(fs.getattr("link").await.unwrap().kind(), FileKind::Symlink);
        assert_eq!(fs.readlink("link").await.unwrap(), "target");
    }

    #[tokio::test]
    async fn test_readdir_includes_dot_entries() {
        let fs = vfs(
            MemoryFileChannel::new().with_file("d/a", b"").with_file("d/b", b""),
            TimeUnit::Seconds,
        );
        assert_eq!(fs.readdir("d").await.unwrap(), vec![".", "..", "a", "b"]);
        assert_eq!(fs.list("d").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_utimens_none_sets_now() {
        let fs = vfs(MemoryFileChannel::new().with_file("f", b""), TimeUnit::Seconds);
        fs.utimens("f", Some((10, 20))).await.unwrap();
        let attrs = fs.getattr("f").await.unwrap();
        assert_eq!((attrs.atime, attrs.mtime), (10, 20));

        let before = TimeUnit::Seconds.of_system_time(SystemTime::now());
        fs.utimens("f", None).await.unwrap();
        let attrs = fs.getattr("f").await.unwrap();
        assert!(attrs.mtime >= before);
        assert_eq!(attrs.atime, attrs.mtime);
    }

    #[tokio::test]
    async fn test_size_of_special_entries() {
        let fs = vfs(
            MemoryFileChannel::new().with_symlink("dangling", "missing"),
            TimeUnit::Seconds,
        );
        assert_eq!(fs.size_of("dangling").await.unwrap(), -1);
        assert_eq!(fs.size_of("absent").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let fs = vfs(MemoryFileChannel::new(), TimeUnit::Seconds);
        fs.create("notes.txt", 0o600).await.unwrap();
        assert_eq!(fs.getattr("notes.txt").await.unwrap().mode & 0o7777, 0o600);
        assert_eq!(fs.write("notes.txt", b"hello world", 0).await.unwrap(), 11);
        assert_eq!(fs.read("notes.txt", 5, 6).await.unwrap(), b"world");
        fs.truncate("notes.txt", 5).await.unwrap();
        assert_eq!(fs.read_bytes("notes.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_makedirs_over_file_fails() {
        let fs = vfs(MemoryFileChannel::new().with_file("a", b""), TimeUnit::Seconds);
        assert!(fs.makedirs("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_closes_channel() {
        let channel = Arc::new(MemoryFileChannel::new());
        let fs = VirtualFilesystem::new(channel.clone(), TimeUnit::Seconds);
        fs.destroy().await.unwrap();
        assert!(channel.is_closed());
    }
}
