//! Foreground session multiplexing between the local terminal and a channel.
//!
//! A session moves through: optional prompt synchronisation and payload
//! injection, then a raw-mode event loop that forwards keystrokes to the
//! channel and channel output to the screen (or a capture buffer). The saved
//! terminal mode is restored on every exit path.

mod resize;
mod terminal;

use std::io::Write;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::RemoteError;
use crate::transport::{Channel, TermSize};

pub use resize::ResizeListener;
pub use terminal::{LocalTerminal, RawModeGuard, StdTerminal};

/// Largest chunk moved in one read, in either direction
pub const BUFFER_SIZE: usize = 1024;

/// Output suffix taken to mean "the shell is ready for input".
///
/// Only matches prompts ending in `$ `; other prompts never synchronise.
pub const PROMPT_MARKER: &[u8] = b"$ ";

/// Where channel output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Write to the local terminal as it arrives
    #[default]
    Passthrough,
    /// Buffer and return to the caller
    Capture,
}

/// When a scripted payload is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadDelivery {
    /// Right away, with no echo handling
    Immediate,
    /// After the shell prompt appears, discarding the echo
    #[default]
    AfterPrompt,
}

/// Per-session settings for [`InteractiveProxy::run`].
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Output destination
    pub mode: OutputMode,
    /// Bytes typed on the user's behalf
    pub payload: Option<Vec<u8>>,
    /// Payload timing
    pub delivery: PayloadDelivery,
}

impl ProxyOptions {
    /// Passthrough with no payload.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Capture with no payload.
    pub fn capture() -> Self {
        Self {
            mode: OutputMode::Capture,
            ..Self::default()
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>, delivery: PayloadDelivery) -> Self {
        self.payload = Some(payload.into());
        self.delivery = delivery;
        self
    }
}

/// Number of bytes a remote shell echoes for `payload`.
///
/// The terminal line discipline turns each `\n` into `\r\n`.
pub fn echo_len(payload: &[u8]) -> usize {
    payload.len() + payload.iter().filter(|b| **b == b'\n').count()
}

struct Sink {
    mode: OutputMode,
    captured: Vec<u8>,
}

impl Sink {
    fn emit(&mut self, data: &[u8], out: &mut (dyn Write + Send)) -> std::io::Result<()> {
        match self.mode {
            OutputMode::Capture => {
                self.captured.extend_from_slice(data);
                Ok(())
            }
            OutputMode::Passthrough => {
                out.write_all(data)?;
                out.flush()
            }
        }
    }
}

/// Drives one interactive session at a time against a local terminal.
#[derive(Debug)]
pub struct InteractiveProxy<T> {
    terminal: T,
}

impl<T: LocalTerminal> InteractiveProxy<T> {
    /// Create a proxy over `terminal`.
    pub fn new(terminal: T) -> Self {
        Self { terminal }
    }

    /// Size to request for a new pseudo-terminal.
    pub fn terminal_size(&self) -> TermSize {
        self.terminal.size().unwrap_or_default()
    }

    /// The local terminal.
    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    /// Run the session until either side closes.
    ///
    /// Returns the captured output in [`OutputMode::Capture`], `None`
    /// otherwise.
    pub async fn run<C: Channel + ?Sized>(
        &mut self,
        channel: &mut C,
        options: ProxyOptions,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut resize = if channel.is_pty() {
            self.terminal.resize_events().unwrap_or_else(|e| {
                debug!(error = %e, "window-change notifications unavailable");
                None
            })
        } else {
            None
        };

        if let Some(payload) = options.payload.as_deref() {
            inject(channel, payload, options.delivery).await?;
        }

        let mut sink = Sink {
            mode: options.mode,
            captured: Vec::new(),
        };
        let raw = self.terminal.enter_raw()?;
        let result = self.pump(channel, &mut resize, &mut sink).await;
        drop(raw);
        result?;

        Ok(match sink.mode {
            OutputMode::Capture => Some(sink.captured),
            OutputMode::Passthrough => None,
        })
    }

    async fn pump<C: Channel + ?Sized>(
        &mut self,
        channel: &mut C,
        resize: &mut Option<ResizeListener>,
        sink: &mut Sink,
    ) -> Result<(), RemoteError> {
        let mut input = [0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                chunk = channel.read(BUFFER_SIZE) => match chunk? {
                    Some(data) => sink.emit(&data, self.terminal.output())?,
                    None => {
                        debug!("channel closed");
                        break;
                    }
                },
                n = self.terminal.input().read(&mut input) => {
                    let n = n?;
                    if n == 0 {
                        debug!("local input closed");
                        break;
                    }
                    channel.write_all(&input[..n]).await?;
                }
                Some(size) = next_resize(resize) => {
                    if let Err(e) = channel.resize(size).await {
                        debug!(error = %e, "resize rejected");
                    }
                }
            }
        }
        Ok(())
    }
}

async fn next_resize(listener: &mut Option<ResizeListener>) -> Option<TermSize> {
    match listener {
        Some(listener) => listener.next().await,
        None => std::future::pending().await,
    }
}

async fn inject<C: Channel + ?Sized>(
    channel: &mut C,
    payload: &[u8],
    delivery: PayloadDelivery,
) -> Result<(), RemoteError> {
    match delivery {
        PayloadDelivery::Immediate => channel.write_all(payload).await,
        PayloadDelivery::AfterPrompt => {
            if !wait_for_prompt(channel).await? {
                debug!("channel closed before prompt, payload not sent");
                return Ok(());
            }
            channel.write_all(payload).await?;
            discard(channel, echo_len(payload)).await
        }
    }
}

/// Read until the output ends with [`PROMPT_MARKER`]. False on EOF.
async fn wait_for_prompt<C: Channel + ?Sized>(channel: &mut C) -> Result<bool, RemoteError> {
    let mut seen = Vec::new();
    while !seen.ends_with(PROMPT_MARKER) {
        match channel.read(BUFFER_SIZE).await? {
            Some(chunk) => seen.extend_from_slice(&chunk),
            None => return Ok(false),
        }
    }
    Ok(true)
}

async fn discard<C: Channel + ?Sized>(channel: &mut C, mut remaining: usize) -> Result<(), RemoteError> {
    while remaining > 0 {
        match channel.read(remaining).await? {
            Some(chunk) => remaining = remaining.saturating_sub(chunk.len()),
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{FakeTerminal, ScriptedChannel};

    #[test]
    fn test_echo_len_counts_newline_expansion() {
        assert_eq!(echo_len(b"whoami\n"), 8);
        assert_eq!(echo_len(b"a\nb\n"), 6);
        assert_eq!(echo_len(b""), 0);
    }

    #[tokio::test]
    async fn test_passthrough_writes_to_terminal() {
        let terminal = FakeTerminal::new();
        let screen = terminal.screen();
        let mut proxy = InteractiveProxy::new(terminal);
        let mut channel = ScriptedChannel::new().data(b"hello ").data(b"world").eof();

        let result = proxy.run(&mut channel, ProxyOptions::passthrough()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(screen.contents(), b"hello world");
    }

    #[tokio::test]
    async fn test_input_forwarded_verbatim() {
        let terminal = FakeTerminal::new().with_input(b"\x03ls\n");
        let mut proxy = InteractiveProxy::new(terminal);
        let mut channel = ScriptedChannel::new().wait_for_writes(1).data(b"done").eof();

        let out = proxy.run(&mut channel, ProxyOptions::capture()).await.unwrap();
        assert_eq!(out.unwrap(), b"done");
        assert_eq!(channel.written(), b"\x03ls\n");
    }

    #[tokio::test]
    async fn test_local_eof_ends_session() {
        let terminal = FakeTerminal::new().with_input(b"").closing_input();
        let mut proxy = InteractiveProxy::new(terminal);
        let mut channel = ScriptedChannel::new().wait_for_writes(1);

        let out = proxy.run(&mut channel, ProxyOptions::capture()).await.unwrap();
        assert_eq!(out.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_immediate_payload_skips_prompt() {
        let terminal = FakeTerminal::new();
        let mut proxy = InteractiveProxy::new(terminal);
        let mut channel = ScriptedChannel::new().wait_for_writes(1).data(b"ok").eof();

        let options = ProxyOptions::capture().with_payload(b"input\n".to_vec(), PayloadDelivery::Immediate);
        let out = proxy.run(&mut channel, options).await.unwrap();
        assert_eq!(out.unwrap(), b"ok");
        assert_eq!(channel.written(), b"input\n");
    }

    #[tokio::test]
    async fn test_prompt_never_seen() {
        let terminal = FakeTerminal::new();
        let mut proxy = InteractiveProxy::new(terminal);
        let mut channel = ScriptedChannel::new().data(b"> ").eof();

        let options = ProxyOptions::capture().with_payload(b"id\n".to_vec(), PayloadDelivery::AfterPrompt);
        let out = proxy.run(&mut channel, options).await.unwrap();
        assert_eq!(out.unwrap(), b"");
        assert!(channel.written().is_empty());
    }

    #[tokio::test]
    async fn test_plain_channel_gets_no_resize_listener() {
        let terminal = FakeTerminal::new();
        let resizes = terminal.resize_sender();
        let mut proxy = InteractiveProxy::new(terminal);
        let mut channel = ScriptedChannel::new().plain().data(b"x").eof();

        resizes.try_send(TermSize { cols: 1, rows: 1 }).unwrap();
        proxy.run(&mut channel, ProxyOptions::capture()).await.unwrap();
        assert!(channel.resizes().is_empty());
    }
}
