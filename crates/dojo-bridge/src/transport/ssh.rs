//! SSH implementation of [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Channel, Connector, TermSize, Transport};
use crate::config::BridgeConfig;
use crate::error::RemoteError;
use crate::vfs::{FileChannel, SftpChannel};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const KEEPALIVE_MAX: usize = 3;

/// Client handler that trusts the host key on first use.
struct AcceptHostKey {
    host: String,
}

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting host key"
        );
        Ok(true)
    }
}

/// Connects to the configured host with public-key authentication.
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: BridgeConfig,
}

impl SshConnector {
    /// Create a connector for `config`.
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, RemoteError> {
        Ok(Arc::new(SshTransport::connect(&self.config).await?))
    }
}

/// One authenticated SSH connection.
pub struct SshTransport {
    handle: client::Handle<AcceptHostKey>,
    project_path: String,
    files: OnceCell<Arc<SftpChannel>>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("project_path", &self.project_path)
            .finish_non_exhaustive()
    }
}

impl SshTransport {
    /// Connect to `config.host` and authenticate with `config.identity_file`.
    pub async fn connect(config: &BridgeConfig) -> Result<Self, RemoteError> {
        let identity = config.identity_path();
        let key = russh_keys::load_secret_key(&identity, None).map_err(|e| {
            RemoteError::Identity(format!(
                "failed to load private key {}: {e}",
                identity.display()
            ))
        })?;

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });
        let handler = AcceptHostKey {
            host: config.host.clone(),
        };
        let mut handle = client::connect(ssh_config, (config.host.as_str(), config.port), handler)
            .await
            .map_err(|e| {
                RemoteError::Connection(format!("{}:{}: {e}", config.host, config.port))
            })?;

        let accepted = handle
            .authenticate_publickey(&config.username, Arc::new(key))
            .await
            .map_err(|e| RemoteError::Connection(format!("authentication failed: {e}")))?;
        if !accepted {
            return Err(RemoteError::Connection(format!(
                "public key for {} was rejected by {}",
                config.username, config.host
            )));
        }

        info!(host = %config.host, port = config.port, user = %config.username, "connected");
        Ok(Self {
            handle,
            project_path: config.project_path.clone(),
            files: OnceCell::new(),
        })
    }

    async fn open_session(&self) -> Result<russh::Channel<Msg>, RemoteError> {
        Ok(self.handle.channel_open_session().await?)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_exec(&self, command: Option<&str>) -> Result<Box<dyn Channel>, RemoteError> {
        let channel = self.open_session().await?;
        match command {
            Some(command) => channel.exec(true, command).await?,
            None => channel.request_shell(true).await?,
        }
        debug!(command, "opened exec channel");
        Ok(Box::new(SshChannel::new(channel, false)))
    }

    async fn open_pty(
        &self,
        term: &str,
        size: TermSize,
        command: Option<&str>,
    ) -> Result<Box<dyn Channel>, RemoteError> {
        let channel = self.open_session().await?;
        channel
            .request_pty(
                true,
                term,
                u32::from(size.cols),
                u32::from(size.rows),
                0,
                0,
                &[],
            )
            .await?;
        match command {
            Some(command) => channel.exec(true, command).await?,
            None => channel.request_shell(true).await?,
        }
        debug!(command, cols = size.cols, rows = size.rows, "opened pty channel");
        Ok(Box::new(SshChannel::new(channel, true)))
    }

    async fn open_file_channel(&self) -> Result<Arc<dyn FileChannel>, RemoteError> {
        let files = self
            .files
            .get_or_try_init(|| async {
                let channel = self.open_session().await?;
                channel.request_subsystem(true, "sftp").await?;
                let session = SftpSession::new(channel.into_stream())
                    .await
                    .map_err(|e| RemoteError::Protocol(format!("sftp handshake failed: {e}")))?;
                debug!(root = %self.project_path, "opened file-transfer channel");
                Ok::<_, RemoteError>(Arc::new(SftpChannel::new(
                    session,
                    self.project_path.clone(),
                )))
            })
            .await?;
        let files: Arc<dyn FileChannel> = files.clone();
        Ok(files)
    }

    async fn close(&self) -> Result<(), RemoteError> {
        if let Some(files) = self.files.get()
            && let Err(e) = files.close().await
        {
            warn!(error = %e, "failed to close file-transfer channel");
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        info!("disconnected");
        Ok(())
    }
}

/// A session channel carrying one command or shell.
pub struct SshChannel {
    inner: russh::Channel<Msg>,
    pending: Vec<u8>,
    eof: bool,
    pty: bool,
}

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("pty", &self.pty)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl SshChannel {
    fn new(inner: russh::Channel<Msg>, pty: bool) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            eof: false,
            pty,
        }
    }
}

#[async_trait]
impl Channel for SshChannel {
    fn is_pty(&self) -> bool {
        self.pty
    }

    async fn read(&mut self, max: usize) -> Result<Option<Vec<u8>>, RemoteError> {
        loop {
            if !self.pending.is_empty() {
                let n = max.min(self.pending.len());
                return Ok(Some(self.pending.drain(..n).collect()));
            }
            if self.eof {
                return Ok(None);
            }
            match self.inner.wait().await {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    self.pending.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "remote command exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => self.eof = true,
                Some(_) => {}
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        self.inner.data(data).await?;
        Ok(())
    }

    async fn resize(&mut self, size: TermSize) -> Result<(), RemoteError> {
        self.inner
            .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        if !self.eof {
            self.inner.eof().await?;
        }
        self.inner.close().await?;
        debug!("closed channel");
        Ok(())
    }
}
