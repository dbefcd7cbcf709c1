//! Scripted collaborators for exercising the proxy, pool and runner without a
//! network or a real terminal.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::proxy::{LocalTerminal, ResizeListener};
use crate::runner::SessionProbe;
use crate::transport::{Channel, Connector, TermSize, Transport};
use crate::vfs::{FileChannel, MemoryFileChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
enum Step {
    Data(Vec<u8>),
    Error(String),
    Eof,
    AwaitWrites(usize),
    AwaitResizes(usize),
}

#[derive(Debug, Default)]
struct LogState {
    written: Vec<u8>,
    writes: usize,
    resizes: Vec<TermSize>,
    closed: bool,
}

/// Shared view of what was sent to a [`ScriptedChannel`].
#[derive(Debug, Clone, Default)]
pub struct ChannelLog(Arc<Mutex<LogState>>);

impl ChannelLog {
    /// Every byte written, in order.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.0).written.clone()
    }

    /// Every resize request, in order.
    pub fn resizes(&self) -> Vec<TermSize> {
        lock(&self.0).resizes.clone()
    }

    /// Whether the channel was closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.0).closed
    }
}

/// Channel that replays a fixed script of remote output.
///
/// Reads return the script in order, split to the requested size. A wait
/// step blocks reads until enough writes or resizes have been recorded.
#[derive(Debug)]
pub struct ScriptedChannel {
    steps: VecDeque<Step>,
    echo: bool,
    echoed: VecDeque<u8>,
    pty: bool,
    log: ChannelLog,
}

impl Default for ScriptedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChannel {
    /// Empty PTY-backed script.
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            echo: false,
            echoed: VecDeque::new(),
            pty: true,
            log: ChannelLog::default(),
        }
    }

    /// Behave as a plain channel with no pseudo-terminal.
    pub fn plain(mut self) -> Self {
        self.pty = false;
        self
    }

    /// Echo writes back like a terminal, expanding `\n` to `\r\n`.
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Emit `data`.
    pub fn data(mut self, data: &[u8]) -> Self {
        if !data.is_empty() {
            self.steps.push_back(Step::Data(data.to_vec()));
        }
        self
    }

    /// Fail the next read.
    pub fn error(mut self, message: &str) -> Self {
        self.steps.push_back(Step::Error(message.to_string()));
        self
    }

    /// Close the remote side.
    pub fn eof(mut self) -> Self {
        self.steps.push_back(Step::Eof);
        self
    }

    /// Hold further output until `count` writes have happened.
    pub fn wait_for_writes(mut self, count: usize) -> Self {
        self.steps.push_back(Step::AwaitWrites(count));
        self
    }

    /// Hold further output until `count` resizes have happened.
    pub fn wait_for_resizes(mut self, count: usize) -> Self {
        self.steps.push_back(Step::AwaitResizes(count));
        self
    }

    /// Handle onto the recorded traffic.
    pub fn log(&self) -> ChannelLog {
        self.log.clone()
    }

    /// Every byte written, in order.
    pub fn written(&self) -> Vec<u8> {
        self.log.written()
    }

    /// Every resize request, in order.
    pub fn resizes(&self) -> Vec<TermSize> {
        self.log.resizes()
    }

    fn gate_open(&self, step: &Step) -> bool {
        let log = lock(&self.log.0);
        match step {
            Step::AwaitWrites(n) => log.writes >= *n,
            Step::AwaitResizes(n) => log.resizes.len() >= *n,
            _ => true,
        }
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    fn is_pty(&self) -> bool {
        self.pty
    }

    async fn read(&mut self, max: usize) -> Result<Option<Vec<u8>>, RemoteError> {
        loop {
            if !self.echoed.is_empty() {
                let n = max.min(self.echoed.len());
                return Ok(Some(self.echoed.drain(..n).collect()));
            }
            let Some(step) = self.steps.front_mut() else {
                return Ok(None);
            };
            match step {
                Step::Data(data) => {
                    let n = max.min(data.len());
                    let chunk: Vec<u8> = data.drain(..n).collect();
                    if data.is_empty() {
                        self.steps.pop_front();
                    }
                    return Ok(Some(chunk));
                }
                Step::Error(message) => {
                    let message = message.clone();
                    self.steps.pop_front();
                    return Err(RemoteError::Protocol(message));
                }
                Step::Eof => return Ok(None),
                Step::AwaitWrites(_) | Step::AwaitResizes(_) => {}
            }
            let open = self.steps.front().is_some_and(|step| self.gate_open(step));
            if open {
                self.steps.pop_front();
            } else {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        {
            let mut log = lock(&self.log.0);
            log.written.extend_from_slice(data);
            log.writes += 1;
        }
        if self.echo {
            for byte in data {
                if *byte == b'\n' {
                    self.echoed.push_back(b'\r');
                }
                self.echoed.push_back(*byte);
            }
        }
        Ok(())
    }

    async fn resize(&mut self, size: TermSize) -> Result<(), RemoteError> {
        if !self.pty {
            return Err(RemoteError::Protocol("no pseudo-terminal".to_string()));
        }
        lock(&self.log.0).resizes.push(size);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        lock(&self.log.0).closed = true;
        Ok(())
    }
}

/// Mode of a [`FakeTerminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Line-buffered with local echo
    Cooked,
    /// Byte-at-a-time
    Raw,
}

/// Restores a [`FakeTerminal`]'s previous mode on drop.
#[derive(Debug)]
pub struct FakeRawGuard {
    mode: Arc<Mutex<TerminalMode>>,
    saved: TerminalMode,
}

impl Drop for FakeRawGuard {
    fn drop(&mut self) {
        *lock(&self.mode) = self.saved;
    }
}

/// Captured terminal output.
#[derive(Debug, Clone, Default)]
pub struct Screen(Arc<Mutex<Vec<u8>>>);

impl Screen {
    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }
}

impl Write for Screen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Keyboard input that replays chunks, then either ends or stays silent.
#[derive(Debug, Default)]
struct ScriptedInput {
    chunks: VecDeque<Vec<u8>>,
    closes: bool,
}

impl AsyncRead for ScriptedInput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.chunks.front_mut() {
            Some(chunk) => {
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk[..n]);
                chunk.drain(..n);
                if chunk.is_empty() {
                    this.chunks.pop_front();
                }
                Poll::Ready(Ok(()))
            }
            None if this.closes => Poll::Ready(Ok(())),
            None => Poll::Pending,
        }
    }
}

/// In-memory stand-in for the local terminal.
#[derive(Debug)]
pub struct FakeTerminal {
    size: Option<TermSize>,
    mode: Arc<Mutex<TerminalMode>>,
    screen: Screen,
    input: ScriptedInput,
    resize_tx: mpsc::Sender<TermSize>,
    resize_rx: Option<mpsc::Receiver<TermSize>>,
}

impl Default for FakeTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTerminal {
    /// Cooked terminal of unknown size with no pending input.
    pub fn new() -> Self {
        let (resize_tx, resize_rx) = mpsc::channel(16);
        Self {
            size: None,
            mode: Arc::new(Mutex::new(TerminalMode::Cooked)),
            screen: Screen::default(),
            input: ScriptedInput::default(),
            resize_tx,
            resize_rx: Some(resize_rx),
        }
    }

    /// Report `size` as the window size.
    pub fn with_size(mut self, size: TermSize) -> Self {
        self.size = Some(size);
        self
    }

    /// Queue keyboard input.
    pub fn with_input(mut self, data: &[u8]) -> Self {
        if !data.is_empty() {
            self.input.chunks.push_back(data.to_vec());
        }
        self
    }

    /// End input once the queued chunks are consumed.
    pub fn closing_input(mut self) -> Self {
        self.input.closes = true;
        self
    }

    /// Current mode.
    pub fn mode(&self) -> TerminalMode {
        *lock(&self.mode)
    }

    /// Handle onto the output.
    pub fn screen(&self) -> Screen {
        self.screen.clone()
    }

    /// Sender that simulates window-change events.
    pub fn resize_sender(&self) -> mpsc::Sender<TermSize> {
        self.resize_tx.clone()
    }
}

impl LocalTerminal for FakeTerminal {
    type RawGuard = FakeRawGuard;

    fn size(&self) -> Option<TermSize> {
        self.size
    }

    fn enter_raw(&mut self) -> io::Result<FakeRawGuard> {
        let mut mode = lock(&self.mode);
        let saved = *mode;
        *mode = TerminalMode::Raw;
        Ok(FakeRawGuard {
            mode: self.mode.clone(),
            saved,
        })
    }

    fn input(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        &mut self.input
    }

    fn output(&mut self) -> &mut (dyn Write + Send) {
        &mut self.screen
    }

    fn resize_events(&mut self) -> io::Result<Option<ResizeListener>> {
        Ok(self.resize_rx.take().map(ResizeListener::from_receiver))
    }
}

/// How a channel was requested from a [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedChannel {
    /// Terminal type and size for PTY channels
    pub pty: Option<(String, TermSize)>,
    /// Command, or `None` for a shell
    pub command: Option<String>,
}

/// Transport handing out queued [`ScriptedChannel`]s and a shared file
/// channel.
pub struct FakeTransport {
    files: Arc<dyn FileChannel>,
    channels: Mutex<VecDeque<ScriptedChannel>>,
    opened: Mutex<Vec<OpenedChannel>>,
    closes: AtomicUsize,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("opened", &lock(&self.opened).len())
            .finish_non_exhaustive()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new(Arc::new(MemoryFileChannel::new()))
    }
}

impl FakeTransport {
    /// Transport whose file channel is `files`.
    pub fn new(files: Arc<dyn FileChannel>) -> Self {
        Self {
            files,
            channels: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    /// Queue the channel returned by the next open.
    pub fn push_channel(&self, channel: ScriptedChannel) {
        lock(&self.channels).push_back(channel);
    }

    /// Channel requests seen so far.
    pub fn opened(&self) -> Vec<OpenedChannel> {
        lock(&self.opened).clone()
    }

    /// Number of [`Transport::close`] calls.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn next_channel(&self, request: OpenedChannel) -> Box<dyn Channel> {
        let mut channel = lock(&self.channels).pop_front().unwrap_or_default();
        channel.pty = request.pty.is_some();
        lock(&self.opened).push(request);
        Box::new(channel)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_exec(&self, command: Option<&str>) -> Result<Box<dyn Channel>, RemoteError> {
        Ok(self.next_channel(OpenedChannel {
            pty: None,
            command: command.map(str::to_string),
        }))
    }

    async fn open_pty(
        &self,
        term: &str,
        size: TermSize,
        command: Option<&str>,
    ) -> Result<Box<dyn Channel>, RemoteError> {
        Ok(self.next_channel(OpenedChannel {
            pty: Some((term.to_string(), size)),
            command: command.map(str::to_string),
        }))
    }

    async fn open_file_channel(&self) -> Result<Arc<dyn FileChannel>, RemoteError> {
        Ok(self.files.clone())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct ConnectorState {
    transport: Arc<FakeTransport>,
    connections: AtomicUsize,
    fail: bool,
}

/// Connector that always yields the same [`FakeTransport`].
#[derive(Debug, Clone)]
pub struct FakeConnector(Arc<ConnectorState>);

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new(Arc::new(FakeTransport::default()))
    }
}

impl FakeConnector {
    /// Connector for `transport`.
    pub fn new(transport: Arc<FakeTransport>) -> Self {
        Self(Arc::new(ConnectorState {
            transport,
            connections: AtomicUsize::new(0),
            fail: false,
        }))
    }

    /// Connector whose every attempt fails.
    pub fn failing() -> Self {
        Self(Arc::new(ConnectorState {
            transport: Arc::new(FakeTransport::default()),
            connections: AtomicUsize::new(0),
            fail: true,
        }))
    }

    /// The transport handed out.
    pub fn transport(&self) -> Arc<FakeTransport> {
        self.0.transport.clone()
    }

    /// Successful connections made.
    pub fn connections(&self) -> usize {
        self.0.connections.load(Ordering::SeqCst)
    }

    /// Closes of the handed-out transport.
    pub fn closes(&self) -> usize {
        self.0.transport.closes()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, RemoteError> {
        if self.0.fail {
            return Err(RemoteError::Connection("connection refused".to_string()));
        }
        self.0.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.transport.clone())
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl SessionProbe for StaticProbe {
    async fn is_active(&self) -> Result<bool, RemoteError> {
        Ok(self.0)
    }
}
