use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::{Connector, Transport};
use crate::error::RemoteError;

/// Single-slot connection pool.
///
/// The first [`SessionPool::get`] connects; later calls share the same
/// transport until [`SessionPool::close`] empties the slot.
pub struct SessionPool {
    connector: Box<dyn Connector>,
    slot: Mutex<Option<Arc<dyn Transport>>>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool").finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Create an empty pool that connects through `connector`.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            slot: Mutex::new(None),
        }
    }

    /// Shared transport, connecting on first use.
    pub async fn get(&self) -> Result<Arc<dyn Transport>, RemoteError> {
        let mut slot = self.slot.lock().await;
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }
        let transport = self.connector.connect().await?;
        *slot = Some(transport.clone());
        Ok(transport)
    }

    /// Whether a transport is currently held.
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Close and drop the held transport, if any.
    pub async fn close(&self) -> Result<(), RemoteError> {
        let transport = self.slot.lock().await.take();
        match transport {
            Some(transport) => {
                debug!("closing pooled transport");
                transport.close().await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    #[tokio::test]
    async fn test_connects_once() {
        let connector = FakeConnector::default();
        let pool = SessionPool::new(connector.clone());
        assert!(!pool.is_connected().await);

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_close_empties_slot() {
        let connector = FakeConnector::default();
        let pool = SessionPool::new(connector.clone());
        pool.get().await.unwrap();
        pool.close().await.unwrap();
        assert!(!pool.is_connected().await);

        pool.get().await.unwrap();
        assert_eq!(connector.connections(), 2);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_slot_empty() {
        let connector = FakeConnector::failing();
        let pool = SessionPool::new(connector);
        assert!(matches!(pool.get().await, Err(RemoteError::Connection(_))));
        assert!(!pool.is_connected().await);
    }
}
