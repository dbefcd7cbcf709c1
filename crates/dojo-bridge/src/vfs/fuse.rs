//! Kernel-facing adapter from `fuser` callbacks to [`FsOperations`].
//!
//! `fuser` drives the filesystem from a blocking thread; each callback enters
//! the tokio runtime through [`Handle::block_on`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyWrite, Request, Session, TimeOrNow,
};
use libc::c_int;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::channel::{FileKind, FsError, join_path};
use super::filesystem::{Attributes, TimeUnit};
use super::ops::FsOperations;

/// Inode of the mounted root
pub const ROOT_INO: u64 = 1;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;
const ROOT_PATH: &str = ".";

/// Result of a [`mount`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// The filesystem was mounted and has since been unmounted
    Unmounted,
    /// The mount point was not empty, so nothing was mounted
    AlreadyMounted,
}

/// Bidirectional inode number <-> remote path map.
///
/// Each inode carries the kernel's lookup count. An entry is dropped once the
/// kernel forgets every reference it was handed.
#[derive(Debug)]
struct InodeTable {
    paths: HashMap<u64, InodeEntry>,
    inodes: HashMap<String, u64>,
    next: u64,
}

#[derive(Debug)]
struct InodeEntry {
    path: String,
    lookups: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(
            ROOT_INO,
            InodeEntry {
                path: ROOT_PATH.to_string(),
                lookups: 1,
            },
        );
        table.inodes.insert(ROOT_PATH.to_string(), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(|entry| entry.path.as_str())
    }

    /// Inode for `path`, without taking a kernel reference.
    fn inode(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                lookups: 0,
            },
        );
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    /// Inode for `path`, counting one reference handed to the kernel.
    fn lookup(&mut self, path: &str) -> u64 {
        let ino = self.inode(path);
        if let Some(entry) = self.paths.get_mut(&ino) {
            entry.lookups += 1;
        }
        ino
    }

    /// Drop `nlookup` kernel references to `ino`.
    fn forget_inode(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(entry) = self.paths.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups > 0 {
            return;
        }
        if let Some(entry) = self.paths.remove(&ino)
            && self.inodes.get(&entry.path) == Some(&ino)
        {
            self.inodes.remove(&entry.path);
        }
    }

    /// Detach `path` and everything beneath it from their inodes.
    fn forget(&mut self, path: &str) {
        let prefix = format!("{path}/");
        let detached: Vec<String> = self
            .inodes
            .keys()
            .filter(|p| *p == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in detached {
            if let Some(ino) = self.inodes.remove(&p) {
                self.paths.remove(&ino);
            }
        }
    }

    /// Repoint `old` and everything beneath it at `new`.
    fn rename(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        self.forget(new);
        let prefix = format!("{old}/");
        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(path, _)| *path == old || path.starts_with(&prefix))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.inodes.remove(&path);
            self.inodes.insert(renamed.clone(), ino);
            if let Some(entry) = self.paths.get_mut(&ino) {
                entry.path = renamed;
            }
        }
    }
}

fn parent_path(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ROOT_PATH,
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::File | FileKind::Other => FileType::RegularFile,
    }
}

fn file_attr(ino: u64, attrs: &Attributes, unit: TimeUnit) -> FileAttr {
    let kind = attrs.kind();
    let mtime = unit.to_system_time(attrs.mtime);
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: unit.to_system_time(attrs.atime),
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: file_type(kind),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: if kind == FileKind::Directory { 2 } else { 1 },
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// `fuser::Filesystem` implementation over any [`FsOperations`].
pub struct FuseAdapter<F> {
    ops: Arc<F>,
    handle: Handle,
    inodes: InodeTable,
}

impl<F> std::fmt::Debug for FuseAdapter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseAdapter")
            .field("inodes", &self.inodes.paths.len())
            .finish_non_exhaustive()
    }
}

impl<F: FsOperations> FuseAdapter<F> {
    /// Create an adapter that runs operations on `handle`'s runtime.
    pub fn new(ops: Arc<F>, handle: Handle) -> Self {
        Self {
            ops,
            handle,
            inodes: InodeTable::new(),
        }
    }

    fn block_on<T>(&self, fut: impl Future<Output = T>) -> T {
        self.handle.block_on(fut)
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_path(&parent, name))
    }

    /// Fetch attributes for `path` and hand its inode to the kernel.
    fn entry_for(&mut self, path: &str) -> Result<FileAttr, c_int> {
        let ops = self.ops.clone();
        let attrs = self.block_on(ops.getattr(path)).map_err(|e| e.errno())?;
        let ino = self.inodes.lookup(path);
        Ok(file_attr(ino, &attrs, self.ops.time_unit()))
    }

    fn attr_for(&self, ino: u64, path: &str) -> Result<FileAttr, c_int> {
        let attrs = self.block_on(self.ops.getattr(path)).map_err(|e| e.errno())?;
        Ok(file_attr(ino, &attrs, self.ops.time_unit()))
    }

    fn run(&self, fut: impl Future<Output = Result<(), FsError>>) -> Result<(), c_int> {
        self.block_on(fut).map_err(|e| e.errno())
    }

    /// Resolve the requested access/modification times.
    ///
    /// `None` means both were "now", which the remote side sets itself.
    fn resolve_times(
        &self,
        path: &str,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<Option<(u64, u64)>, c_int> {
        let explicit = |t: &Option<TimeOrNow>| matches!(t, Some(TimeOrNow::SpecificTime(_)));
        if !explicit(&atime) && !explicit(&mtime) {
            return Ok(None);
        }
        let unit = self.ops.time_unit();
        let current = self.block_on(self.ops.getattr(path)).map_err(|e| e.errno())?;
        let pick = |t: Option<TimeOrNow>, fallback: u64| match t {
            Some(TimeOrNow::SpecificTime(at)) => unit.of_system_time(at),
            Some(TimeOrNow::Now) => unit.of_system_time(SystemTime::now()),
            None => fallback,
        };
        Ok(Some((pick(atime, current.atime), pick(mtime, current.mtime))))
    }

    fn setattr_inner(
        &self,
        ino: u64,
        mode: Option<u32>,
        owner: (Option<u32>, Option<u32>),
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, c_int> {
        let path = self.path_of(ino)?;
        if let Some(mode) = mode {
            self.run(self.ops.chmod(&path, mode))?;
        }
        let (uid, gid) = owner;
        if uid.is_some() || gid.is_some() {
            let current = self.block_on(self.ops.getattr(&path)).map_err(|e| e.errno())?;
            let uid = uid.unwrap_or(current.uid);
            let gid = gid.unwrap_or(current.gid);
            self.run(self.ops.chown(&path, uid, gid))?;
        }
        if let Some(size) = size {
            self.run(self.ops.truncate(&path, size))?;
        }
        if atime.is_some() || mtime.is_some() {
            let times = self.resolve_times(&path, atime, mtime)?;
            self.run(self.ops.utimens(&path, times))?;
        }
        self.attr_for(ino, &path)
    }

    fn readdir_entries(&mut self, ino: u64) -> Result<Vec<(u64, FileType, String)>, c_int> {
        let path = self.path_of(ino)?;
        let ops = self.ops.clone();
        let names = self.block_on(ops.readdir(&path)).map_err(|e| e.errno())?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let entry = match name.as_str() {
                "." => (ino, FileType::Directory, name),
                ".." => (
                    self.inodes.inode(parent_path(&path)),
                    FileType::Directory,
                    name,
                ),
                _ => {
                    let child = join_path(&path, &name);
                    let kind = match self.block_on(ops.getattr(&child)) {
                        Ok(attrs) => file_type(attrs.kind()),
                        Err(e) => {
                            debug!(path = %child, error = %e, "stat failed during readdir");
                            FileType::RegularFile
                        }
                    };
                    (self.inodes.inode(&child), kind, name)
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl<F: FsOperations> Filesystem for FuseAdapter<F> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.entry_for(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget_inode(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.path_of(ino).and_then(|path| self.attr_for(ino, &path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.setattr_inner(ino, mode, (uid, gid), size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.path_of(ino).and_then(|path| {
            self.block_on(self.ops.readlink(&path))
                .map_err(|e| e.errno())
        });
        match result {
            Ok(target) => reply.data(target.as_bytes()),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.run(self.ops.mkdir(&path, mode))?;
            self.entry_for(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.run(self.ops.unlink(&path))?;
            self.inodes.forget(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.run(self.ops.rmdir(&path))?;
            self.inodes.forget(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, link_name).and_then(|path| {
            let target = target.to_str().ok_or(libc::EINVAL)?;
            self.run(self.ops.symlink(&path, target))?;
            self.entry_for(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.child_path(parent, name).and_then(|old| {
            let new = self.child_path(newparent, newname)?;
            self.run(self.ops.rename(&old, &new))?;
            self.inodes.rename(&old, &new);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;
            self.block_on(self.ops.read(&path, size as usize, offset))
                .map_err(|e| e.errno())
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;
            self.block_on(self.ops.write(&path, data, offset))
                .map_err(|e| e.errno())
        });
        match result {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.readdir_entries(ino) {
            Ok(entries) => entries,
            Err(code) => return reply.error(code),
        };
        let skip = usize::try_from(offset).unwrap_or(0);
        for (index, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
            if reply.add(entry_ino, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.run(self.ops.create(&path, mode))?;
            self.entry_for(&path)
        });
        match result {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(code) => reply.error(code),
        }
    }

    fn destroy(&mut self) {
        if let Err(e) = self.block_on(self.ops.destroy()) {
            warn!(error = %e, "failed to close file channel on unmount");
        }
    }
}

fn mount_options() -> Vec<MountOption> {
    // Permission checks stay with the remote server
    vec![MountOption::FSName("dojo-bridge".to_string())]
}

/// A mount point whose FUSE server died reports `ENOTCONN` on every access.
fn is_stale(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTCONN)
}

/// Lazily detach a dead FUSE mount left at `mount_point`.
fn clear_stale_mount(mount_point: &Path) -> Result<(), FsError> {
    warn!(mount_point = %mount_point.display(), "clearing stale mount from an earlier session");
    let attempts: [(&str, &[&str]); 3] = [
        ("fusermount", &["-u", "-z"]),
        ("fusermount3", &["-u", "-z"]),
        ("umount", &[]),
    ];
    for (program, args) in attempts {
        match Command::new(program).args(args).arg(mount_point).status() {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => debug!(program, %status, "unmount attempt failed"),
            Err(e) => debug!(program, error = %e, "unmount helper unavailable"),
        }
    }
    Err(FsError::Failure(format!(
        "{}: stale mount point, unmount it manually",
        mount_point.display()
    )))
}

/// Make sure `mount_point` exists and is usable.
///
/// Returns `Some` when something already occupies it.
fn prepare_mount_point(mount_point: &Path) -> Result<Option<MountStatus>, FsError> {
    if let Err(e) = std::fs::metadata(mount_point)
        && is_stale(&e)
    {
        clear_stale_mount(mount_point)?;
    }
    std::fs::create_dir_all(mount_point)?;
    if std::fs::read_dir(mount_point)?.next().is_some() {
        warn!(mount_point = %mount_point.display(), "mount point is not empty");
        return Ok(Some(MountStatus::AlreadyMounted));
    }
    Ok(None)
}

/// Wait for Ctrl+C, or for the session to end on its own.
async fn wait_for_unmount(finished: impl Fn() -> bool) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut listening = true;
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            result = &mut ctrl_c, if listening => match result {
                Ok(()) => {
                    info!("interrupt received, unmounting");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl+C");
                    listening = false;
                }
            },
            _ = tick.tick() => {
                if finished() {
                    return;
                }
            }
        }
    }
}

/// Mount `ops` at `mount_point` and block until Ctrl+C or an external unmount.
///
/// Must be called off the runtime's worker threads, e.g. from
/// `tokio::task::spawn_blocking`.
pub fn mount<F: FsOperations + 'static>(
    ops: Arc<F>,
    mount_point: &Path,
    handle: Handle,
) -> Result<MountStatus, FsError> {
    if let Some(status) = prepare_mount_point(mount_point)? {
        return Ok(status);
    }

    let adapter = FuseAdapter::new(ops, handle.clone());
    let mut session = Session::new(adapter, mount_point, &mount_options())?;
    let mut unmounter = session.unmount_callable();
    let worker = thread::Builder::new()
        .name("dojo-bridge-fuse".to_string())
        .spawn(move || session.run())?;
    info!(mount_point = %mount_point.display(), "mounted remote project, press Ctrl+C to unmount");

    handle.block_on(wait_for_unmount(|| worker.is_finished()));
    unmounter.unmount()?;
    let result = worker
        .join()
        .map_err(|_| FsError::Failure("filesystem thread panicked".to_string()))?;
    result?;
    info!(mount_point = %mount_point.display(), "unmounted");
    Ok(MountStatus::Unmounted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::vfs::{MemoryFileChannel, VirtualFilesystem};

    fn adapter(channel: MemoryFileChannel, rt: &tokio::runtime::Runtime) -> FuseAdapter<VirtualFilesystem> {
        let vfs = VirtualFilesystem::new(Arc::new(channel), TimeUnit::Nanoseconds);
        FuseAdapter::new(Arc::new(vfs), rt.handle().clone())
    }

    #[test]
    fn test_inode_table_assigns_stable_numbers() {
        let mut table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some("."));
        let a = table.inode("a");
        assert_eq!(table.inode("a"), a);
        assert_ne!(table.inode("b"), a);
        table.forget("a");
        assert_eq!(table.path(a), None);
    }

    #[test]
    fn test_inode_table_drops_forgotten_entries() {
        let mut table = InodeTable::new();
        let ino = table.lookup("a");
        assert_eq!(table.lookup("a"), ino);

        table.forget_inode(ino, 1);
        assert_eq!(table.path(ino), Some("a"));
        table.forget_inode(ino, 1);
        assert_eq!(table.path(ino), None);
        assert_ne!(table.lookup("a"), ino);

        table.forget_inode(ROOT_INO, 10);
        assert_eq!(table.path(ROOT_INO), Some("."));
    }

    #[test]
    fn test_inode_table_rename_moves_descendants() {
        let mut table = InodeTable::new();
        let dir = table.inode("old");
        let child = table.inode("old/file");
        let other = table.inode("older");
        table.rename("old", "new");
        assert_eq!(table.path(dir), Some("new"));
        assert_eq!(table.path(child), Some("new/file"));
        assert_eq!(table.path(other), Some("older"));
    }

    #[test]
    fn test_inode_table_rename_replaces_destination_tree() {
        let mut table = InodeTable::new();
        let src = table.inode("src");
        let stale = table.inode("dst");
        let stale_child = table.inode("dst/inner");
        table.rename("src", "dst");
        assert_eq!(table.path(src), Some("dst"));
        assert_eq!(table.path(stale), None);
        assert_eq!(table.path(stale_child), None);
        assert_eq!(table.inode("dst"), src);

        table.rename("dst", "dst");
        assert_eq!(table.path(src), Some("dst"));
    }

    #[test]
    fn test_mount_options_leave_permissions_to_remote() {
        let options = mount_options();
        assert!(!options.contains(&MountOption::DefaultPermissions));
        assert!(options.contains(&MountOption::FSName("dojo-bridge".to_string())));
    }

    #[test]
    fn test_stale_mount_detection() {
        assert!(is_stale(&io::Error::from_raw_os_error(libc::ENOTCONN)));
        assert!(!is_stale(&io::Error::from_raw_os_error(libc::ENOENT)));
        assert!(!is_stale(&io::Error::from(io::ErrorKind::NotConnected)));
    }

    #[test]
    fn test_prepare_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let point = dir.path().join("mnt/project");
        assert_eq!(prepare_mount_point(&point).unwrap(), None);
        assert!(point.is_dir());

        std::fs::write(point.join("busy"), b"x").unwrap();
        assert_eq!(
            prepare_mount_point(&point).unwrap(),
            Some(MountStatus::AlreadyMounted)
        );
    }

    #[test]
    fn test_wait_for_unmount_returns_when_session_ends() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), wait_for_unmount(|| true))
                .await
                .unwrap();
        });
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("a/b"), "a");
        assert_eq!(parent_path("a"), ".");
        assert_eq!(parent_path("/etc"), "/");
    }

    #[test]
    fn test_file_attr_conversion() {
        let attrs = Attributes {
            mode: 0o040750,
            uid: 1000,
            gid: 100,
            size: 1025,
            atime: 2_000_000_000,
            mtime: 3_000_000_000,
        };
        let attr = file_attr(7, &attrs, TimeUnit::Nanoseconds);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o750);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.mtime, std::time::UNIX_EPOCH + Duration::from_secs(3));
    }

    #[test]
    fn test_lookup_assigns_inode_and_errno() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut fs = adapter(MemoryFileChannel::new().with_file("src/main.rs", b"fn main() {}"), &rt);

        let attr = fs.entry_for("src/main.rs").unwrap();
        assert_eq!(attr.size, 12);
        assert_eq!(fs.path_of(attr.ino).unwrap(), "src/main.rs");
        assert_eq!(fs.entry_for("src/missing.rs").unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn test_readdir_entries_report_kinds() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut fs = adapter(
            MemoryFileChannel::new().with_dir("d/sub").with_file("d/f", b"x"),
            &rt,
        );
        let dir = fs.entry_for("d").unwrap().ino;
        let entries = fs.readdir_entries(dir).unwrap();
        let names: Vec<_> = entries.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec![".", "..", "f", "sub"]);
        assert_eq!(entries[0].0, dir);
        assert_eq!(entries[1].0, ROOT_INO);
        assert_eq!(entries[2].1, FileType::RegularFile);
        assert_eq!(entries[3].1, FileType::Directory);
    }

    #[test]
    fn test_setattr_applies_mode_size_and_times() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut fs = adapter(MemoryFileChannel::new().with_file("f", b"abcdef"), &rt);
        let ino = fs.entry_for("f").unwrap().ino;

        let when = std::time::UNIX_EPOCH + Duration::from_secs(1_000);
        let attr = fs
            .setattr_inner(
                ino,
                Some(0o100600),
                (None, Some(50)),
                Some(2),
                None,
                Some(TimeOrNow::SpecificTime(when)),
            )
            .unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.gid, 50);
        assert_eq!(attr.size, 2);
        assert_eq!(attr.mtime, when);
    }
}
