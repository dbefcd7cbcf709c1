//! SFTP-backed file channel.

use std::path::Path;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::File;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::channel::{FileChannel, FsError, RemoteAttributes, join_path};

/// File channel speaking SFTP over an SSH subsystem channel.
///
/// SFTP has no server-side working directory, so relative paths are joined
/// onto `root` before every request.
pub struct SftpChannel {
    session: SftpSession,
    root: String,
}

impl std::fmt::Debug for SftpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpChannel")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl SftpChannel {
    /// Wrap an established SFTP session rooted at `root`.
    pub fn new(session: SftpSession, root: impl Into<String>) -> Self {
        Self {
            session,
            root: root.into(),
        }
    }

    /// Directory relative paths are resolved against.
    pub fn root(&self) -> &str {
        &self.root
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else if path.is_empty() || path == "." {
            self.root.clone()
        } else {
            join_path(&self.root, path.trim_start_matches("./"))
        }
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> Result<File, FsError> {
        self.session
            .open_with_flags(self.resolve(path), flags)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn set_attributes(&self, path: &str, attrs: FileAttributes) -> Result<(), FsError> {
        self.session
            .set_metadata(self.resolve(path), attrs)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }
}

/// Close a remote handle, logging instead of failing.
///
/// Writers flush before this, so every write reply has been checked by then.
async fn release(mut file: File, path: &str) {
    if let Err(e) = file.shutdown().await {
        warn!(path, error = %e, "failed to close remote file");
    }
}

fn convert(attrs: &FileAttributes) -> RemoteAttributes {
    RemoteAttributes {
        mode: attrs.permissions.unwrap_or(0),
        uid: attrs.uid.unwrap_or(0),
        gid: attrs.gid.unwrap_or(0),
        size: attrs.size.unwrap_or(0),
        atime: attrs.atime.map(u64::from).unwrap_or(0),
        mtime: attrs.mtime.map(u64::from).unwrap_or(0),
    }
}

fn to_wire_time(secs: u64) -> u32 {
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Translate an SFTP client error into the filesystem taxonomy.
fn map_sftp_error(path: &str, err: SftpError) -> FsError {
    match err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => FsError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => FsError::PermissionDenied(path.to_string()),
            StatusCode::Failure | StatusCode::OpUnsupported => {
                FsError::Failure(format!("{path}: {}", status.error_message))
            }
            _ => FsError::Protocol(format!("{path}: {}", status.error_message)),
        },
        other => FsError::Protocol(format!("{path}: {other}")),
    }
}

fn map_io_error(path: &str, err: std::io::Error) -> FsError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
        _ => FsError::Io(err),
    }
}

#[async_trait]
impl FileChannel for SftpChannel {
    async fn stat(&self, path: &str) -> Result<RemoteAttributes, FsError> {
        let attrs = self
            .session
            .metadata(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(convert(&attrs))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteAttributes, FsError> {
        let attrs = self
            .session
            .symlink_metadata(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(convert(&attrs))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let entries = self
            .session
            .read_dir(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(entries
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn read_at(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let mut file = self.open(path, OpenFlags::READ).await?;
        let mut buf = Vec::with_capacity(size);
        let result = async {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            (&mut file).take(size as u64).read_to_end(&mut buf).await
        }
        .await;
        release(file, path).await;
        result.map_err(|e| map_io_error(path, e))?;
        Ok(buf)
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let mut file = self.open(path, OpenFlags::WRITE).await?;
        let result = async {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await
        }
        .await;
        release(file, path).await;
        result.map_err(|e| map_io_error(path, e))?;
        Ok(data.len())
    }

    async fn create(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let file = self
            .open(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await?;
        release(file, path).await;
        self.chmod(path, mode).await
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let mut file = self.open(path, OpenFlags::READ).await?;
        let mut buf = Vec::new();
        let result = file.read_to_end(&mut buf).await;
        release(file, path).await;
        result.map_err(|e| map_io_error(path, e))?;
        Ok(buf)
    }

    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let mut file = self
            .open(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await?;
        let result = async {
            file.write_all(data).await?;
            file.flush().await
        }
        .await;
        release(file, path).await;
        result.map_err(|e| map_io_error(path, e))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.session
            .create_dir(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        self.chmod(path, mode).await
    }

    async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.session
            .remove_dir(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.session
            .remove_file(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.session
            .rename(self.resolve(from), self.resolve(to))
            .await
            .map_err(|e| map_sftp_error(from, e))
    }

    async fn symlink(&self, link: &str, target: &str) -> Result<(), FsError> {
        // OpenSSH reads the target first and the new link second.
        self.session
            .symlink(target, self.resolve(link))
            .await
            .map_err(|e| map_sftp_error(link, e))
    }

    async fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.session
            .read_link(self.resolve(path))
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode & 0o7777);
        self.set_attributes(path, attrs).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        let mut attrs = FileAttributes::empty();
        attrs.uid = Some(uid);
        attrs.gid = Some(gid);
        self.set_attributes(path, attrs).await
    }

    async fn truncate(&self, path: &str, length: u64) -> Result<(), FsError> {
        let mut attrs = FileAttributes::empty();
        attrs.size = Some(length);
        self.set_attributes(path, attrs).await
    }

    async fn set_times(&self, path: &str, atime: u64, mtime: u64) -> Result<(), FsError> {
        let mut attrs = FileAttributes::empty();
        attrs.atime = Some(to_wire_time(atime));
        attrs.mtime = Some(to_wire_time(mtime));
        self.set_attributes(path, attrs).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, FsError> {
        let mut file = self.open(remote, OpenFlags::READ).await?;
        let result = async {
            let mut out = tokio::fs::File::create(local).await?;
            let copied = tokio::io::copy(&mut file, &mut out).await?;
            out.flush().await?;
            Ok::<_, std::io::Error>(copied)
        }
        .await;
        release(file, remote).await;
        let copied = result.map_err(|e| map_io_error(remote, e))?;
        debug!(remote, local = %local.display(), bytes = copied, "downloaded file");
        Ok(copied)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<u64, FsError> {
        let mut input = tokio::fs::File::open(local).await?;
        let mut file = self
            .open(remote, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await?;
        let result = async {
            let copied = tokio::io::copy(&mut input, &mut file).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(copied)
        }
        .await;
        release(file, remote).await;
        let copied = result.map_err(|e| map_io_error(remote, e))?;
        debug!(remote, local = %local.display(), bytes = copied, "uploaded file");
        Ok(copied)
    }

    async fn close(&self) -> Result<(), FsError> {
        debug!(root = %self.root, "closing file-transfer channel");
        self.session
            .close()
            .await
            .map_err(|e| map_sftp_error(&self.root, e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use russh_sftp::protocol::{Handle, Status, Version};
    use russh_sftp::server::Handler;

    /// In-process SFTP server that records symlink requests in wire order.
    #[derive(Default)]
    struct RecordingServer {
        reject_writes: bool,
        symlinks: Arc<Mutex<Vec<(String, String)>>>,
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    impl Handler for RecordingServer {
        type Error = StatusCode;

        fn unimplemented(&self) -> Self::Error {
            StatusCode::OpUnsupported
        }

        async fn init(
            &mut self,
            _version: u32,
            _extensions: HashMap<String, String>,
        ) -> Result<Version, Self::Error> {
            Ok(Version::new())
        }

        async fn open(
            &mut self,
            id: u32,
            filename: String,
            _pflags: OpenFlags,
            _attrs: FileAttributes,
        ) -> Result<Handle, Self::Error> {
            Ok(Handle { id, handle: filename })
        }

        async fn close(&mut self, id: u32, _handle: String) -> Result<Status, Self::Error> {
            Ok(ok(id))
        }

        async fn write(
            &mut self,
            id: u32,
            _handle: String,
            _offset: u64,
            _data: Vec<u8>,
        ) -> Result<Status, Self::Error> {
            if self.reject_writes {
                Err(StatusCode::Failure)
            } else {
                Ok(ok(id))
            }
        }

        async fn symlink(
            &mut self,
            id: u32,
            linkpath: String,
            targetpath: String,
        ) -> Result<Status, Self::Error> {
            self.symlinks.lock().unwrap().push((linkpath, targetpath));
            Ok(ok(id))
        }
    }

    async fn connect(server: RecordingServer) -> SftpChannel {
        let (client, remote) = tokio::io::duplex(64 * 1024);
        russh_sftp::server::run(remote, server).await;
        let session = SftpSession::new(client).await.unwrap();
        SftpChannel::new(session, "/home/hacker")
    }

    #[tokio::test]
    async fn test_rejected_write_is_reported() {
        let channel = connect(RecordingServer {
            reject_writes: true,
            ..Default::default()
        })
        .await;
        assert!(channel.write_at("notes.txt", 0, b"data").await.is_err());
        assert!(channel.write_all("notes.txt", b"data").await.is_err());
    }

    #[tokio::test]
    async fn test_accepted_write_reports_length() {
        let channel = connect(RecordingServer::default()).await;
        assert_eq!(channel.write_at("notes.txt", 2, b"data").await.unwrap(), 4);
        channel.write_all("notes.txt", b"data").await.unwrap();
    }

    #[tokio::test]
    async fn test_symlink_sends_target_first() {
        let symlinks = Arc::new(Mutex::new(Vec::new()));
        let channel = connect(RecordingServer {
            symlinks: symlinks.clone(),
            ..Default::default()
        })
        .await;
        channel.symlink("latest", "releases/v2").await.unwrap();
        let recorded = symlinks.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![("releases/v2".to_string(), "/home/hacker/latest".to_string())]
        );
    }

    fn status(code: StatusCode) -> SftpError {
        SftpError::Status(Status {
            id: 1,
            status_code: code,
            error_message: "remote says no".to_string(),
            language_tag: "en-US".to_string(),
        })
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_sftp_error("a", status(StatusCode::NoSuchFile)),
            FsError::NotFound(p) if p == "a"
        ));
        assert!(matches!(
            map_sftp_error("a", status(StatusCode::PermissionDenied)),
            FsError::PermissionDenied(_)
        ));
        assert!(matches!(
            map_sftp_error("a", status(StatusCode::Failure)),
            FsError::Failure(_)
        ));
        assert!(matches!(
            map_sftp_error("a", status(StatusCode::BadMessage)),
            FsError::Protocol(_)
        ));
        assert!(matches!(
            map_sftp_error("a", status(StatusCode::ConnectionLost)),
            FsError::Protocol(_)
        ));
    }

    #[test]
    fn test_io_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(map_io_error("f", err), FsError::PermissionDenied(_)));
        let err = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(map_io_error("f", err), FsError::Io(_)));
    }

    #[test]
    fn test_attribute_conversion() {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(0o100644);
        attrs.size = Some(42);
        attrs.mtime = Some(1_700_000_000);
        let converted = convert(&attrs);
        assert_eq!(converted.mode, 0o100644);
        assert_eq!(converted.size, 42);
        assert_eq!(converted.mtime, 1_700_000_000);
        assert_eq!(converted.atime, 0);
    }

    #[test]
    fn test_wire_time_saturates() {
        assert_eq!(to_wire_time(5), 5);
        assert_eq!(to_wire_time(u64::MAX), u32::MAX);
    }
}
