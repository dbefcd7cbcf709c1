//! In-memory file channel.
//!
//! Behaves like a remote SFTP tree rooted at the project directory. Used by
//! tests and anywhere a filesystem is needed without a live connection.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::channel::{FileChannel, FileKind, FsError, RemoteAttributes, join_path};

const MAX_SYMLINK_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum NodeData {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    perm: u32,
    uid: u32,
    gid: u32,
    atime: u64,
    mtime: u64,
}

impl Node {
    fn new(data: NodeData, perm: u32) -> Self {
        let now = now_secs();
        Self {
            data,
            perm: perm & 0o7777,
            uid: 1000,
            gid: 1000,
            atime: now,
            mtime: now,
        }
    }

    fn kind(&self) -> FileKind {
        match self.data {
            NodeData::File(_) => FileKind::File,
            NodeData::Dir => FileKind::Directory,
            NodeData::Symlink(_) => FileKind::Symlink,
        }
    }

    fn attributes(&self) -> RemoteAttributes {
        let size = match &self.data {
            NodeData::File(data) => data.len() as u64,
            NodeData::Dir => 0,
            NodeData::Symlink(target) => target.len() as u64,
        };
        RemoteAttributes {
            mode: self.kind().type_bits() | self.perm,
            uid: self.uid,
            gid: self.gid,
            size,
            atime: self.atime,
            mtime: self.mtime,
        }
    }
}

type Tree = BTreeMap<String, Node>;

/// File channel backed by an in-memory tree.
#[derive(Debug)]
pub struct MemoryFileChannel {
    nodes: Mutex<Tree>,
    denied: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Default for MemoryFileChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileChannel {
    /// Create an empty tree containing only the root directory.
    pub fn new() -> Self {
        let mut nodes = Tree::new();
        nodes.insert(String::new(), Node::new(NodeData::Dir, 0o755));
        Self {
            nodes: Mutex::new(nodes),
            denied: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Add a file, creating missing parent directories.
    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        let path = normalize(path);
        {
            let mut nodes = self.tree();
            insert_parents(&mut nodes, &path);
            nodes.insert(path, Node::new(NodeData::File(data.to_vec()), 0o644));
        }
        self
    }

    /// Add a directory, creating missing parent directories.
    pub fn with_dir(self, path: &str) -> Self {
        let path = normalize(path);
        {
            let mut nodes = self.tree();
            insert_parents(&mut nodes, &path);
            nodes.insert(path, Node::new(NodeData::Dir, 0o755));
        }
        self
    }

    /// Add a symlink, creating missing parent directories.
    pub fn with_symlink(self, path: &str, target: &str) -> Self {
        let path = normalize(path);
        {
            let mut nodes = self.tree();
            insert_parents(&mut nodes, &path);
            nodes.insert(path, Node::new(NodeData::Symlink(target.to_string()), 0o777));
        }
        self
    }

    /// Make every operation on `path` fail with permission denied.
    pub fn deny(self, path: &str) -> Self {
        self.denied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path));
        self
    }

    /// Whether [`FileChannel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, path: &str) -> Result<String, FsError> {
        let normalized = normalize(path);
        let denied = self.denied.lock().unwrap_or_else(|e| e.into_inner());
        if denied.contains(&normalized) {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        Ok(normalized)
    }

    /// Resolve symlinks until a non-link node (or a missing one) is reached.
    fn follow(nodes: &Tree, path: &str, requested: &str) -> Result<String, FsError> {
        let mut current = path.to_string();
        for _ in 0..MAX_SYMLINK_DEPTH {
            match nodes.get(&current).map(|n| &n.data) {
                Some(NodeData::Symlink(target)) => {
                    current = if target.starts_with('/') {
                        normalize(target)
                    } else {
                        normalize(&join_path(parent_of(&current).unwrap_or(""), target))
                    };
                }
                Some(_) => return Ok(current),
                None => return Err(FsError::NotFound(requested.to_string())),
            }
        }
        Err(FsError::Failure(format!("{requested}: too many levels of symbolic links")))
    }

    fn require_parent_dir(nodes: &Tree, path: &str, requested: &str) -> Result<(), FsError> {
        let parent = parent_of(path).unwrap_or("");
        match nodes.get(parent).map(|n| &n.data) {
            Some(NodeData::Dir) => Ok(()),
            Some(_) => Err(FsError::Failure(format!("{requested}: parent is not a directory"))),
            None => Err(FsError::NotFound(requested.to_string())),
        }
    }

    fn file_mut<'a>(
        nodes: &'a mut Tree,
        path: &str,
        requested: &str,
    ) -> Result<&'a mut Node, FsError> {
        let target = Self::follow(nodes, path, requested)?;
        let node = nodes
            .get_mut(&target)
            .ok_or_else(|| FsError::NotFound(requested.to_string()))?;
        match node.data {
            NodeData::File(_) => Ok(node),
            _ => Err(FsError::Failure(format!("{requested}: not a regular file"))),
        }
    }

    fn node_mut<'a>(
        nodes: &'a mut Tree,
        path: &str,
        requested: &str,
    ) -> Result<&'a mut Node, FsError> {
        let target = Self::follow(nodes, path, requested)?;
        nodes
            .get_mut(&target)
            .ok_or_else(|| FsError::NotFound(requested.to_string()))
    }
}

#[async_trait]
impl FileChannel for MemoryFileChannel {
    async fn stat(&self, path: &str) -> Result<RemoteAttributes, FsError> {
        let key = self.check(path)?;
        let nodes = self.tree();
        let target = Self::follow(&nodes, &key, path)?;
        nodes
            .get(&target)
            .map(Node::attributes)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteAttributes, FsError> {
        let key = self.check(path)?;
        self.tree()
            .get(&key)
            .map(Node::attributes)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let key = self.check(path)?;
        let nodes = self.tree();
        let dir = Self::follow(&nodes, &key, path)?;
        if !matches!(nodes.get(&dir).map(|n| &n.data), Some(NodeData::Dir)) {
            return Err(FsError::Failure(format!("{path}: not a directory")));
        }
        Ok(nodes
            .keys()
            .filter(|k| !k.is_empty() && parent_of(k) == Some(dir.as_str()))
            .map(|k| name_of(k).to_string())
            .collect())
    }

    async fn read_at(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        let node = Self::file_mut(&mut nodes, &key, path)?;
        let NodeData::File(data) = &node.data else {
            return Err(FsError::Failure(format!("{path}: not a regular file")));
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        let node = Self::file_mut(&mut nodes, &key, path)?;
        if let NodeData::File(contents) = &mut node.data {
            let start = usize::try_from(offset)
                .map_err(|_| FsError::Failure(format!("{path}: offset too large")))?;
            let end = start + data.len();
            if contents.len() < end {
                contents.resize(end, 0);
            }
            contents[start..end].copy_from_slice(data);
        }
        node.mtime = now_secs();
        Ok(data.len())
    }

    async fn create(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        Self::require_parent_dir(&nodes, &key, path)?;
        if matches!(nodes.get(&key).map(|n| &n.data), Some(NodeData::Dir)) {
            return Err(FsError::Failure(format!("{path}: is a directory")));
        }
        nodes.insert(key, Node::new(NodeData::File(Vec::new()), mode));
        Ok(())
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        match &Self::file_mut(&mut nodes, &key, path)?.data {
            NodeData::File(data) => Ok(data.clone()),
            _ => Err(FsError::Failure(format!("{path}: not a regular file"))),
        }
    }

    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        Self::require_parent_dir(&nodes, &key, path)?;
        match nodes.get_mut(&key) {
            Some(node) => match &mut node.data {
                NodeData::File(contents) => {
                    *contents = data.to_vec();
                    node.mtime = now_secs();
                }
                _ => return Err(FsError::Failure(format!("{path}: not a regular file"))),
            },
            None => {
                nodes.insert(key, Node::new(NodeData::File(data.to_vec()), 0o644));
            }
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        if nodes.contains_key(&key) {
            return Err(FsError::Failure(format!("{path}: already exists")));
        }
        Self::require_parent_dir(&nodes, &key, path)?;
        nodes.insert(key, Node::new(NodeData::Dir, mode));
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        match nodes.get(&key).map(|n| &n.data) {
            None => return Err(FsError::NotFound(path.to_string())),
            Some(NodeData::Dir) => {}
            Some(_) => return Err(FsError::Failure(format!("{path}: not a directory"))),
        }
        if key.is_empty() || nodes.keys().any(|k| parent_of(k) == Some(key.as_str())) {
            return Err(FsError::Failure(format!("{path}: directory not empty")));
        }
        nodes.remove(&key);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        match nodes.get(&key).map(|n| &n.data) {
            None => Err(FsError::NotFound(path.to_string())),
            Some(NodeData::Dir) => Err(FsError::Failure(format!("{path}: is a directory"))),
            Some(_) => {
                nodes.remove(&key);
                Ok(())
            }
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let from_key = self.check(from)?;
        let to_key = self.check(to)?;
        let mut nodes = self.tree();
        if !nodes.contains_key(&from_key) {
            return Err(FsError::NotFound(from.to_string()));
        }
        Self::require_parent_dir(&nodes, &to_key, to)?;
        if nodes.contains_key(&to_key) {
            return Err(FsError::Failure(format!("{to}: already exists")));
        }
        let prefix = format!("{from_key}/");
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| **k == from_key || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{to_key}{}", &old[from_key.len()..]);
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn symlink(&self, link: &str, target: &str) -> Result<(), FsError> {
        let key = self.check(link)?;
        let mut nodes = self.tree();
        if nodes.contains_key(&key) {
            return Err(FsError::Failure(format!("{link}: already exists")));
        }
        Self::require_parent_dir(&nodes, &key, link)?;
        nodes.insert(key, Node::new(NodeData::Symlink(target.to_string()), 0o777));
        Ok(())
    }

    async fn readlink(&self, path: &str) -> Result<String, FsError> {
        let key = self.check(path)?;
        match self.tree().get(&key).map(|n| &n.data) {
            Some(NodeData::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(FsError::Failure(format!("{path}: not a symbolic link"))),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        Self::node_mut(&mut nodes, &key, path)?.perm = mode & 0o7777;
        Ok(())
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        let node = Self::node_mut(&mut nodes, &key, path)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    async fn truncate(&self, path: &str, length: u64) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        let node = Self::file_mut(&mut nodes, &key, path)?;
        if let NodeData::File(contents) = &mut node.data {
            let length = usize::try_from(length)
                .map_err(|_| FsError::Failure(format!("{path}: length too large")))?;
            contents.resize(length, 0);
        }
        node.mtime = now_secs();
        Ok(())
    }

    async fn set_times(&self, path: &str, atime: u64, mtime: u64) -> Result<(), FsError> {
        let key = self.check(path)?;
        let mut nodes = self.tree();
        let node = Self::node_mut(&mut nodes, &key, path)?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, FsError> {
        let data = self.read_all(remote).await?;
        tokio::fs::write(local, &data).await?;
        Ok(data.len() as u64)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, FsError> {
        let data = tokio::fs::read(local).await?;
        self.write_all(remote, &data).await?;
        Ok(data.len() as u64)
    }

    async fn close(&self) -> Result<(), FsError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Collapse `.`/`..`/empty components; the root becomes the empty string.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

fn parent_of(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    Some(key.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

fn name_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, name)| name).unwrap_or(key)
}

fn insert_parents(nodes: &mut Tree, key: &str) {
    let mut current = parent_of(key);
    while let Some(dir) = current {
        nodes
            .entry(dir.to_string())
            .or_insert_with(|| Node::new(NodeData::Dir, 0o755));
        current = parent_of(dir);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize("."), "");
        assert_eq!(normalize("./a//b/"), "a/b");
        assert_eq!(normalize("/a/../b"), "b");
    }

    #[tokio::test]
    async fn test_builder_creates_parents() {
        let fs = MemoryFileChannel::new().with_file("a/b/c.txt", b"hi");
        assert_eq!(fs.stat("a/b").await.unwrap().kind(), FileKind::Directory);
        assert_eq!(fs.list_dir("a").await.unwrap(), vec!["b".to_string()]);
        assert_eq!(fs.read_all("/a/b/c.txt").await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_symlink_follow() {
        let fs = MemoryFileChannel::new()
            .with_file("real/data.bin", b"12345")
            .with_symlink("link", "real");
        assert_eq!(fs.stat("link").await.unwrap().kind(), FileKind::Directory);
        assert_eq!(fs.lstat("link").await.unwrap().kind(), FileKind::Symlink);
        assert_eq!(fs.list_dir("link").await.unwrap(), vec!["data.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_rmdir_refuses_non_empty() {
        let fs = MemoryFileChannel::new().with_file("d/f", b"");
        assert!(matches!(fs.rmdir("d").await, Err(FsError::Failure(_))));
        fs.unlink("d/f").await.unwrap();
        fs.rmdir("d").await.unwrap();
        assert!(matches!(fs.stat("d").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let fs = MemoryFileChannel::new().with_file("old/inner/f", b"x");
        fs.rename("old", "new").await.unwrap();
        assert_eq!(fs.read_all("new/inner/f").await.unwrap(), b"x");
        assert!(matches!(fs.stat("old").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_denied_path() {
        let fs = MemoryFileChannel::new().with_file("flag", b"pwn").deny("/flag");
        assert!(matches!(
            fs.read_all("flag").await,
            Err(FsError::PermissionDenied(_))
        ));
    }
}
