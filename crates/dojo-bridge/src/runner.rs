//! Entry points used by the command-line layer.
//!
//! [`RemoteRunner`] decides between running locally (when already inside the
//! remote environment) and going through a pooled transport.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{BridgeConfig, expand_home};
use crate::error::RemoteError;
use crate::proxy::{InteractiveProxy, LocalTerminal, OutputMode, PayloadDelivery, ProxyOptions};
use crate::transport::{SessionPool, Transport};
use crate::vfs::{FileKind, FsError, TimeUnit, VirtualFilesystem, join_path};

/// Set in the environment of every remote session
pub const AUTH_TOKEN_ENV: &str = "DOJO_AUTH_TOKEN";

/// Where this process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// On the user's machine
    Local,
    /// Already inside the remote environment
    InsideRemote,
}

impl ExecutionContext {
    /// Inspect the environment.
    pub fn detect() -> Self {
        if std::env::var_os(AUTH_TOKEN_ENV).is_some() {
            ExecutionContext::InsideRemote
        } else {
            ExecutionContext::Local
        }
    }
}

/// Answers whether a remote environment is currently running.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// True when the remote environment can be used
    async fn is_active(&self) -> Result<bool, RemoteError>;
}

/// Treats a successful connection as an active session.
///
/// A refused or rejected connection means nothing is running remotely. Other
/// failures, such as an unreadable private key, are returned as is.
#[derive(Debug)]
pub struct TransportProbe {
    pool: Arc<SessionPool>,
}

impl TransportProbe {
    /// Probe through `pool`.
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionProbe for TransportProbe {
    async fn is_active(&self) -> Result<bool, RemoteError> {
        match self.pool.get().await {
            Ok(_) => Ok(true),
            Err(RemoteError::Connection(reason)) => {
                debug!(%reason, "remote environment unreachable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// A command to run, or an interactive shell when `command` is `None`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Command line, or `None` for a login shell
    pub command: Option<String>,
    /// Return output instead of printing it
    pub capture: bool,
    /// Bytes typed on the user's behalf
    pub payload: Option<Vec<u8>>,
    /// Allocate a pseudo-terminal
    pub pty: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            command: None,
            capture: false,
            payload: None,
            pty: true,
        }
    }
}

impl RunRequest {
    /// Interactive login shell.
    pub fn shell() -> Self {
        Self::default()
    }

    /// Single command.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Capture output.
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Type `payload` into the session.
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Use a plain channel without a pseudo-terminal.
    pub fn without_pty(mut self) -> Self {
        self.pty = false;
        self
    }
}

/// A single file copy between the local machine and the remote host.
#[derive(Debug, Clone)]
pub enum Transfer {
    /// Remote to local; `local` defaults to the current directory
    Download {
        /// Remote file
        remote: String,
        /// Local file or directory
        local: Option<PathBuf>,
    },
    /// Local to remote; `remote` defaults to the project directory
    Upload {
        /// Local file
        local: PathBuf,
        /// Remote file or directory
        remote: Option<String>,
    },
}

/// Façade over the transport, proxy and filesystem.
pub struct RemoteRunner {
    context: ExecutionContext,
    pool: Arc<SessionPool>,
    probe: Arc<dyn SessionProbe>,
    term: String,
    project_path: String,
    unit: TimeUnit,
}

impl std::fmt::Debug for RemoteRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRunner")
            .field("context", &self.context)
            .field("project_path", &self.project_path)
            .finish_non_exhaustive()
    }
}

impl RemoteRunner {
    /// Create a runner sharing `pool`, with the context taken from the
    /// environment.
    pub fn new(pool: Arc<SessionPool>, config: &BridgeConfig) -> Self {
        Self {
            context: ExecutionContext::detect(),
            probe: Arc::new(TransportProbe::new(pool.clone())),
            pool,
            term: config.term.clone(),
            project_path: config.project_path.clone(),
            unit: TimeUnit::from_nanoseconds_flag(config.timestamps_in_nanoseconds),
        }
    }

    /// Override the detected execution context.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Replace the session probe.
    pub fn with_probe(mut self, probe: Arc<dyn SessionProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Execution context in effect.
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Connection pool in use.
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    async fn require_session(&self) -> Result<Arc<dyn Transport>, RemoteError> {
        if !self.probe.is_active().await? {
            return Err(RemoteError::NoActiveSession);
        }
        self.pool.get().await
    }

    /// Run a command or shell and return its output when capturing.
    pub async fn run<T: LocalTerminal>(
        &self,
        proxy: &mut InteractiveProxy<T>,
        request: RunRequest,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        let RunRequest {
            command,
            capture,
            payload,
            pty,
        } = request;

        if self.context == ExecutionContext::InsideRemote {
            return run_local(command.as_deref(), capture, payload).await;
        }

        let transport = self.require_session().await?;
        let mut channel = if pty {
            transport
                .open_pty(&self.term, proxy.terminal_size(), command.as_deref())
                .await?
        } else {
            transport.open_exec(command.as_deref()).await?
        };

        let options = ProxyOptions {
            mode: if capture {
                OutputMode::Capture
            } else {
                OutputMode::Passthrough
            },
            payload,
            delivery: if command.is_some() {
                PayloadDelivery::Immediate
            } else {
                PayloadDelivery::AfterPrompt
            },
        };
        let result = proxy.run(channel.as_mut(), options).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "failed to close channel");
        }
        result
    }

    /// Filesystem view of the remote project over the shared connection.
    pub async fn filesystem(&self) -> Result<VirtualFilesystem, RemoteError> {
        let transport = self.require_session().await?;
        let channel = transport.open_file_channel().await?;
        Ok(VirtualFilesystem::new(channel, self.unit))
    }

    /// Copy one file in either direction.
    pub async fn transfer(&self, transfer: Transfer) -> Result<(), RemoteError> {
        if self.context == ExecutionContext::InsideRemote {
            return Err(RemoteError::WrongContext);
        }
        let fs = self.filesystem().await?;
        match transfer {
            Transfer::Download { remote, local } => download(&fs, &remote, local).await,
            Transfer::Upload { local, remote } => {
                let remote = remote.unwrap_or_else(|| self.project_path.clone());
                upload(&fs, &local, &remote).await
            }
        }
    }

    /// Contents of a remote file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        if self.context == ExecutionContext::InsideRemote {
            return tokio::fs::read(path).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => RemoteError::ReadDenied(path.to_string()),
                std::io::ErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
                _ => RemoteError::Io(e),
            });
        }
        let fs = self.filesystem().await?;
        fs.read_bytes(path).await.map_err(|e| match e {
            FsError::PermissionDenied(_) => RemoteError::ReadDenied(path.to_string()),
            other => other.into(),
        })
    }
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn parent_dir(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

async fn download(
    fs: &VirtualFilesystem,
    remote: &str,
    local: Option<PathBuf>,
) -> Result<(), RemoteError> {
    if fs.channel().stat(remote).await?.kind() != FileKind::File {
        return Err(RemoteError::NotAFile(remote.to_string()));
    }

    let mut dest = match local {
        Some(path) => expand_home(&path),
        None => std::env::current_dir()?,
    };
    if tokio::fs::metadata(&dest)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        dest.push(file_name(remote));
    }

    let bytes = fs.download(remote, &dest).await?;
    info!(remote, local = %dest.display(), bytes, "downloaded");
    Ok(())
}

async fn upload(fs: &VirtualFilesystem, local: &Path, remote: &str) -> Result<(), RemoteError> {
    let local = expand_home(local);
    let is_file = tokio::fs::metadata(&local)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(RemoteError::NotAFile(local.display().to_string()));
    }

    let mut dest = remote.to_string();
    if !fs.is_file(&dest).await? {
        if fs.is_dir(&dest).await? {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| RemoteError::NotAFile(local.display().to_string()))?;
            dest = join_path(&dest, &name);
        } else if let Some(parent) = parent_dir(&dest)
            && !fs.is_dir(parent).await?
        {
            fs.makedirs(parent).await?;
        }
    }

    let bytes = fs.upload(&local, &dest).await?;
    info!(local = %local.display(), remote = %dest, bytes, "uploaded");
    Ok(())
}

/// Run directly on this machine, as the remote environment would.
async fn run_local(
    command: Option<&str>,
    capture: bool,
    payload: Option<Vec<u8>>,
) -> Result<Option<Vec<u8>>, RemoteError> {
    let mut cmd = match command {
        Some(command) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
        None => Command::new("bash"),
    };
    cmd.stdin(if payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    cmd.stdout(if capture {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(mut stdin), Some(payload)) = (stdin, payload) {
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
        }
        Ok(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    fed?;
    let output = output?;
    debug!(status = %output.status, "local command finished");

    Ok(capture.then_some(output.stdout))
}
