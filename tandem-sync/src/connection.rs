//! Process-wide channel pool.
//!
//! Every editor session in the process shares one channel. Concurrent
//! acquisitions during connection setup await the same in-flight attempt;
//! the channel is closed when the last holder releases it.
//!
//! ```text
//! acquire ─┐
//! acquire ─┼──► Connecting(Shared<probe + connect>) ──► Ready(channel)
//! acquire ─┘            │ failure / timeout
//!                       ▼
//!                    Empty (None for every waiter)
//! ```

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::protocol::ClientId;
use crate::transport::{Channel, Connector};

type PendingChannel = Shared<BoxFuture<'static, Option<Arc<dyn Channel>>>>;

enum Slot {
    Empty,
    Connecting(PendingChannel),
    Ready(Arc<dyn Channel>),
}

struct PoolState {
    slot: Slot,
    refs: usize,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    client_id: ClientId,
    timeout: Duration,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: &SyncConfig) -> Self {
        Self::with_client_id(connector, config, ClientId::generate())
    }

    pub fn with_client_id(connector: Arc<dyn Connector>, config: &SyncConfig, client_id: ClientId) -> Self {
        Self {
            connector,
            client_id,
            timeout: config.probe_timeout(),
            state: Mutex::new(PoolState {
                slot: Slot::Empty,
                refs: 0,
            }),
        }
    }

    /// The identity stamped on every event this process emits.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Obtain the shared channel, connecting if needed. `None` when the
    /// server is unreachable; no reference is held in that case.
    pub async fn acquire(&self) -> Option<Arc<dyn Channel>> {
        let pending = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.refs += 1;
            match &state.slot {
                Slot::Ready(channel) if channel.is_open() => return Some(channel.clone()),
                Slot::Connecting(pending) => pending.clone(),
                _ => {
                    let pending = establish(self.connector.clone(), self.client_id, self.timeout)
                        .boxed()
                        .shared();
                    state.slot = Slot::Connecting(pending.clone());
                    pending
                }
            }
        };

        let result = pending.await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if matches!(state.slot, Slot::Connecting(_)) {
            state.slot = match &result {
                Some(channel) => Slot::Ready(channel.clone()),
                None => Slot::Empty,
            };
        }
        if result.is_none() {
            state.refs = state.refs.saturating_sub(1);
        }
        result
    }

    /// Drop one reference; the channel closes when none remain.
    pub async fn release(&self) {
        let closing = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.refs = state.refs.saturating_sub(1);
            if state.refs > 0 {
                return;
            }
            match std::mem::replace(&mut state.slot, Slot::Empty) {
                Slot::Ready(channel) => Some(channel),
                other => {
                    state.slot = other;
                    None
                }
            }
        };
        if let Some(channel) = closing {
            log::info!("last session released; closing sync channel");
            channel.close().await;
        }
    }

    /// Current number of holders.
    pub async fn refs(&self) -> usize {
        self.state.lock().await.refs
    }
}

async fn establish(connector: Arc<dyn Connector>, client_id: ClientId, timeout: Duration) -> Option<Arc<dyn Channel>> {
    let attempt = async {
        connector.probe().await?;
        connector.connect(client_id).await
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(channel)) => Some(channel),
        Ok(Err(e)) => {
            log::warn!("sync channel unavailable: {e}");
            None
        }
        Err(_) => {
            log::warn!("sync channel setup timed out after {timeout:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;

    fn pool(hub: &MemoryHub) -> ConnectionPool {
        ConnectionPool::new(Arc::new(hub.clone()), &SyncConfig::for_testing())
    }

    #[tokio::test]
    async fn test_concurrent_acquire_connects_once() {
        let hub = MemoryHub::new();
        let pool = pool(&hub);

        let (a, b, c) = tokio::join!(pool.acquire(), pool.acquire(), pool.acquire());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(hub.connections(), 1);
        assert_eq!(pool.refs().await, 3);
        assert_eq!(a.client_id(), pool.client_id());
    }

    #[tokio::test]
    async fn test_closes_on_last_release() {
        let hub = MemoryHub::new();
        let pool = pool(&hub);
        let channel = pool.acquire().await.unwrap();
        pool.acquire().await.unwrap();

        pool.release().await;
        assert!(channel.is_open());
        pool.release().await;
        assert!(!channel.is_open());

        pool.acquire().await.unwrap();
        assert_eq!(hub.connections(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_yields_none_without_ref() {
        let hub = MemoryHub::new();
        hub.set_reachable(false);
        let pool = pool(&hub);
        assert!(pool.acquire().await.is_none());
        assert_eq!(pool.refs().await, 0);

        hub.set_reachable(true);
        assert!(pool.acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_channel_is_replaced() {
        let hub = MemoryHub::new();
        let pool = pool(&hub);
        let first = pool.acquire().await.unwrap();
        hub.disconnect(pool.client_id());
        assert!(!first.is_open());

        let second = pool.acquire().await.unwrap();
        assert!(second.is_open());
        assert_eq!(hub.connections(), 2);
    }
}
