//! Local terminal access: size, raw mode and readiness-driven stdin.

use std::io::{self, IsTerminal, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use crossterm::terminal;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use super::resize::ResizeListener;
use crate::transport::TermSize;

/// The local side of an interactive session.
pub trait LocalTerminal {
    /// Restores the saved terminal mode when dropped
    type RawGuard;

    /// Current window size, if the local side is a terminal
    fn size(&self) -> Option<TermSize>;

    /// Save the current mode and switch to raw mode
    fn enter_raw(&mut self) -> io::Result<Self::RawGuard>;

    /// Keyboard input
    fn input(&mut self) -> &mut (dyn AsyncRead + Unpin + Send);

    /// Screen output
    fn output(&mut self) -> &mut (dyn Write + Send);

    /// Window-change notifications, when supported
    fn resize_events(&mut self) -> io::Result<Option<ResizeListener>>;
}

/// The process's own stdin/stdout terminal.
pub struct StdTerminal {
    input: StdinReader,
    output: io::Stdout,
}

impl std::fmt::Debug for StdTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdTerminal").finish_non_exhaustive()
    }
}

impl Default for StdTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl StdTerminal {
    /// Attach to stdin/stdout. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self {
            input: StdinReader::new(),
            output: io::stdout(),
        }
    }

    /// Size of the controlling terminal, or 80x24 when unknown.
    pub fn query_size() -> TermSize {
        window_size().unwrap_or_default()
    }
}

impl LocalTerminal for StdTerminal {
    type RawGuard = RawModeGuard;

    fn size(&self) -> Option<TermSize> {
        window_size()
    }

    fn enter_raw(&mut self) -> io::Result<RawModeGuard> {
        RawModeGuard::enter(io::stdin().is_terminal())
    }

    fn input(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        &mut self.input
    }

    fn output(&mut self) -> &mut (dyn Write + Send) {
        &mut self.output
    }

    fn resize_events(&mut self) -> io::Result<Option<ResizeListener>> {
        ResizeListener::spawn_sigwinch(StdTerminal::query_size).map(Some)
    }
}

fn window_size() -> Option<TermSize> {
    if !io::stdout().is_terminal() && !io::stdin().is_terminal() {
        return None;
    }
    match terminal::size() {
        Ok((cols, rows)) => nonzero_size(cols, rows),
        Err(e) => {
            debug!(error = %e, "failed to query terminal size");
            None
        }
    }
}

fn nonzero_size(cols: u16, rows: u16) -> Option<TermSize> {
    (cols > 0 && rows > 0).then_some(TermSize { cols, rows })
}

/// Raw mode held for the guard's lifetime.
///
/// Inactive when stdin is not a terminal.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enter(is_terminal: bool) -> io::Result<Self> {
        if !is_terminal {
            debug!("stdin is not a terminal, leaving mode unchanged");
            return Ok(Self { active: false });
        }
        terminal::enable_raw_mode()?;
        Ok(Self { active: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active
            && let Err(e) = terminal::disable_raw_mode()
        {
            debug!(error = %e, "failed to restore terminal mode");
        }
    }
}

struct Stdin0;

impl AsRawFd for Stdin0 {
    fn as_raw_fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }
}

/// Stdin reader driven by epoll readiness.
///
/// Falls back to tokio's blocking-pool stdin when the descriptor cannot be
/// registered (regular files, `/dev/null`).
enum StdinReader {
    Fd(AsyncFd<Stdin0>),
    Fallback(tokio::io::Stdin),
}

impl StdinReader {
    fn new() -> Self {
        match AsyncFd::new(Stdin0) {
            Ok(fd) => StdinReader::Fd(fd),
            Err(e) => {
                debug!(error = %e, "stdin not pollable, using blocking reader");
                StdinReader::Fallback(tokio::io::stdin())
            }
        }
    }
}

/// Read from `fd` only if data is available right now.
///
/// The descriptor stays in blocking mode, since it usually shares its open
/// file description with stdout.
fn read_available(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
    if ready < 0 {
        return Err(io::Error::last_os_error());
    }
    if ready == 0 {
        return Err(io::ErrorKind::WouldBlock.into());
    }
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

impl AsyncRead for StdinReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StdinReader::Fd(fd) => loop {
                let mut guard = ready!(fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| read_available(inner.get_ref().as_raw_fd(), unfilled)) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            },
            StdinReader::Fallback(stdin) => Pin::new(stdin).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sized_window_is_unknown() {
        assert_eq!(nonzero_size(0, 24), None);
        assert_eq!(nonzero_size(80, 0), None);
        assert_eq!(nonzero_size(120, 40), Some(TermSize { cols: 120, rows: 40 }));
    }

    #[test]
    fn test_raw_guard_is_noop_off_terminal() {
        let guard = RawModeGuard::enter(false).unwrap();
        assert!(!guard.active);
        drop(guard);
    }

    #[test]
    fn test_read_available_from_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut buf = [0u8; 16];
        assert_eq!(
            read_available(fds[0], &mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let written = unsafe { libc::write(fds[1], b"ls\n".as_ptr().cast(), 3) };
        assert_eq!(written, 3);
        assert_eq!(read_available(fds[0], &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ls\n");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
