use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::TermSize;

/// Pending resize events kept before new ones are dropped
const RESIZE_QUEUE: usize = 8;

/// Queue of terminal size changes consumed by the proxy loop.
///
/// A listener task turns window-change signals into [`TermSize`] events so
/// the loop only sees them at its next readiness check.
#[derive(Debug)]
pub struct ResizeListener {
    rx: mpsc::Receiver<TermSize>,
    task: Option<JoinHandle<()>>,
}

impl ResizeListener {
    /// Listen for `SIGWINCH`, sizing each event with `query`.
    pub fn spawn_sigwinch(query: fn() -> TermSize) -> std::io::Result<Self> {
        let mut signals = signal(SignalKind::window_change())?;
        let (tx, rx) = mpsc::channel(RESIZE_QUEUE);
        let task = tokio::spawn(async move {
            while signals.recv().await.is_some() {
                match tx.try_send(query()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("resize queue full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });
        Ok(Self {
            rx,
            task: Some(task),
        })
    }

    /// Build a listener fed by an existing channel.
    pub fn from_receiver(rx: mpsc::Receiver<TermSize>) -> Self {
        Self { rx, task: None }
    }

    /// Next size change. `None` once the source is gone.
    pub async fn next(&mut self) -> Option<TermSize> {
        self.rx.recv().await
    }
}

impl Drop for ResizeListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_receiver_yields_events_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut listener = ResizeListener::from_receiver(rx);
        tx.send(TermSize { cols: 100, rows: 40 }).await.unwrap();
        tx.send(TermSize { cols: 90, rows: 30 }).await.unwrap();
        drop(tx);

        assert_eq!(listener.next().await, Some(TermSize { cols: 100, rows: 40 }));
        assert_eq!(listener.next().await, Some(TermSize { cols: 90, rows: 30 }));
        assert_eq!(listener.next().await, None);
    }

    #[tokio::test]
    async fn test_sigwinch_listener_reports_size() {
        let mut listener = ResizeListener::spawn_sigwinch(|| TermSize { cols: 123, rows: 45 }).unwrap();
        // Let the listener task register before raising the signal.
        tokio::task::yield_now().await;
        unsafe {
            libc::raise(libc::SIGWINCH);
        }
        let size = tokio::time::timeout(std::time::Duration::from_secs(5), listener.next())
            .await
            .unwrap();
        assert_eq!(size, Some(TermSize { cols: 123, rows: 45 }));
    }
}
